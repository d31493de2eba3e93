//! Incremental frame codec for masked client frames.
//!
//! The reader is a byte-driven state machine with explicit read-watermarks:
//! each state knows exactly how many buffered bytes it needs before its
//! transition fires, so [`Decoder::decode`] either consumes a known-size
//! slice or reserves the shortfall and waits for more input. One decoder
//! instance carries the fragmentation state across calls; frames from
//! different sockets never share a decoder.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{GatewayError, ProtocolError};
use crate::frame::{parse_opcode, write_frame, OpCode};

/// Frames declaring a longer payload close the connection.
pub const MAX_PAYLOAD_BYTES: u64 = 16 * 1024 * 1024;

/// Reader position in the current frame.
///
/// Advances monotonically per frame:
/// `NeedsInitial -> (NeedsLength16 | NeedsLength64)? -> NeedsMaskingKey ->
/// NeedsPayload -> NeedsInitial`. Any violation lands in `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    NeedsHttpUpgrade,
    NeedsInitial,
    NeedsLength16,
    NeedsLength64,
    NeedsMaskingKey,
    NeedsPayload,
    Closed,
}

/// What a completed frame amounts to, after reassembly.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    /// A full data message; fragments have already been joined.
    Message { binary: bool, payload: BytesMut },
    /// A ping whose payload the connection must echo in a pong.
    Ping(BytesMut),
    /// The peer sent a close frame; the decoder is terminal.
    Closed,
}

/// Decoder half of the engine.
#[derive(Debug)]
pub struct FrameDecoder {
    state: ReadState,
    frame_is_final: bool,
    frame_opcode: OpCode,
    frame_masking_key: [u8; 4],
    frame_nbytes: u64,
    frame_buffer: BytesMut,
    message_buffer: BytesMut,
    message_is_binary: bool,
    message_is_continuing: bool,
    ping_count: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            state: ReadState::NeedsHttpUpgrade,
            frame_is_final: false,
            frame_opcode: OpCode::Continue,
            frame_masking_key: [0; 4],
            frame_nbytes: 0,
            frame_buffer: BytesMut::new(),
            message_buffer: BytesMut::new(),
            message_is_binary: false,
            message_is_continuing: false,
            ping_count: 0,
        }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Leave `NeedsHttpUpgrade` once the 101 response is on the wire.
    pub fn upgrade(&mut self) {
        if self.state == ReadState::NeedsHttpUpgrade {
            self.state = ReadState::NeedsInitial;
        }
    }

    /// Payload for the next liveness ping: the decimal text of a serial
    /// counter, so stalled peers are visible in packet captures.
    pub fn next_ping_payload(&mut self) -> Bytes {
        self.ping_count += 1;
        Bytes::from(self.ping_count.to_string())
    }

    /// Bytes that must be buffered before the current state can fire.
    fn watermark(&self) -> usize {
        match self.state {
            ReadState::NeedsInitial => 2,
            ReadState::NeedsLength16 => 2,
            ReadState::NeedsLength64 => 8,
            ReadState::NeedsMaskingKey => 4,
            ReadState::NeedsPayload => self.frame_nbytes as usize,
            ReadState::NeedsHttpUpgrade | ReadState::Closed => 0,
        }
    }

    fn close(&mut self, error: ProtocolError) -> GatewayError {
        self.state = ReadState::Closed;
        error.into()
    }

    fn set_payload_len(&mut self, len: u64) -> Result<(), GatewayError> {
        if len > MAX_PAYLOAD_BYTES {
            return Err(self.close(ProtocolError::PayloadTooLarge(len)));
        }
        self.frame_nbytes = len;
        self.state = ReadState::NeedsMaskingKey;
        Ok(())
    }

    /// Handle a fully unmasked frame sitting in `frame_buffer`.
    fn dispatch(&mut self) -> Result<Option<Incoming>, GatewayError> {
        match self.frame_opcode {
            OpCode::Continue => {
                if !self.message_is_continuing {
                    return Err(self.close(ProtocolError::UnexpectedContinuation));
                }
                self.message_buffer.extend_from_slice(&self.frame_buffer);
                if self.frame_is_final {
                    self.message_is_continuing = false;
                    return Ok(Some(Incoming::Message {
                        binary: self.message_is_binary,
                        payload: self.message_buffer.split(),
                    }));
                }
                Ok(None)
            }
            OpCode::Text | OpCode::Binary => {
                if self.message_is_continuing {
                    return Err(self.close(ProtocolError::UnfinishedMessage));
                }
                self.message_is_binary = self.frame_opcode == OpCode::Binary;
                if self.frame_is_final {
                    return Ok(Some(Incoming::Message {
                        binary: self.message_is_binary,
                        payload: self.frame_buffer.split(),
                    }));
                }
                self.message_buffer.clear();
                self.message_buffer.extend_from_slice(&self.frame_buffer);
                self.message_is_continuing = true;
                Ok(None)
            }
            OpCode::Close => {
                self.state = ReadState::Closed;
                Ok(Some(Incoming::Closed))
            }
            OpCode::Ping => Ok(Some(Incoming::Ping(self.frame_buffer.split()))),
            OpCode::Pong => Ok(None),
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = Incoming;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Incoming>, GatewayError> {
        loop {
            match self.state {
                ReadState::NeedsHttpUpgrade => return Err(GatewayError::InvalidState),
                ReadState::Closed => return Ok(None),
                _ => {}
            }

            let need = self.watermark();
            if src.len() < need {
                src.reserve(need - src.len());
                return Ok(None);
            }

            match self.state {
                ReadState::NeedsInitial => {
                    let b0 = src[0];
                    let b1 = src[1];
                    src.advance(2);
                    if b0 & 0x70 != 0 {
                        return Err(self.close(ProtocolError::ReservedBits(b0)));
                    }
                    let opcode = match parse_opcode(b0) {
                        Ok(opcode) => opcode,
                        Err(raw) => return Err(self.close(ProtocolError::InvalidOpcode(raw))),
                    };
                    if b1 & 0x80 == 0 {
                        return Err(self.close(ProtocolError::UnmaskedFrame));
                    }
                    self.frame_is_final = b0 & 0x80 != 0;
                    self.frame_opcode = opcode;
                    match b1 & 0x7f {
                        126 => self.state = ReadState::NeedsLength16,
                        127 => self.state = ReadState::NeedsLength64,
                        len => self.set_payload_len(u64::from(len))?,
                    }
                }
                ReadState::NeedsLength16 => {
                    let len = src.get_u16();
                    self.set_payload_len(u64::from(len))?;
                }
                ReadState::NeedsLength64 => {
                    let len = src.get_u64();
                    self.set_payload_len(len)?;
                }
                ReadState::NeedsMaskingKey => {
                    self.frame_masking_key.copy_from_slice(&src[..4]);
                    src.advance(4);
                    self.state = ReadState::NeedsPayload;
                }
                ReadState::NeedsPayload => {
                    let nbytes = self.frame_nbytes as usize;
                    self.frame_buffer.clear();
                    self.frame_buffer.reserve(nbytes);
                    for i in 0..nbytes {
                        self.frame_buffer
                            .put_u8(src[i] ^ self.frame_masking_key[i & 3]);
                    }
                    src.advance(nbytes);
                    self.state = ReadState::NeedsInitial;
                    if let Some(incoming) = self.dispatch()? {
                        return Ok(Some(incoming));
                    }
                }
                ReadState::NeedsHttpUpgrade | ReadState::Closed => unreachable!(),
            }
        }
    }
}

/// Encoder half: server frames, FIN always set, never masked.
#[derive(Debug, Clone, Default)]
pub struct FrameEncoder;

impl Encoder<(OpCode, Bytes)> for FrameEncoder {
    type Error = GatewayError;

    fn encode(&mut self, item: (OpCode, Bytes), dst: &mut BytesMut) -> Result<(), GatewayError> {
        let (opcode, payload) = item;
        write_frame(dst, opcode, &payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgraded() -> FrameDecoder {
        let mut decoder = FrameDecoder::new();
        decoder.upgrade();
        decoder
    }

    /// Build a masked client frame for tests.
    fn client_frame(fin: bool, opcode: u8, mask: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.push(if fin { 0x80 | opcode } else { opcode });
        match payload.len() {
            len @ 0..=125 => raw.push(0x80 | len as u8),
            len @ 126..=65535 => {
                raw.push(0x80 | 126);
                raw.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                raw.push(0x80 | 127);
                raw.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        raw.extend_from_slice(&mask);
        raw.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
        raw
    }

    #[test]
    fn masked_hello_decodes_to_a_text_message() {
        let mut decoder = upgraded();
        let mut src = BytesMut::from(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        match decoder.decode(&mut src).unwrap() {
            Some(Incoming::Message { binary, payload }) => {
                assert!(!binary);
                assert_eq!(&payload[..], b"Hello");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(src.is_empty());
        assert_eq!(decoder.state(), ReadState::NeedsInitial);
    }

    #[test]
    fn fragmented_binary_is_delivered_once_reassembled() {
        let mut decoder = upgraded();
        let mut src = BytesMut::new();
        src.extend_from_slice(&[0x02, 0x81, 0x00, 0x00, 0x00, 0x00, 0xaa]);
        assert!(decoder.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&[0x80, 0x81, 0x00, 0x00, 0x00, 0x00, 0xbb]);
        match decoder.decode(&mut src).unwrap() {
            Some(Incoming::Message { binary, payload }) => {
                assert!(binary);
                assert_eq!(&payload[..], &[0xaa, 0xbb]);
            }
            other => panic!("unexpected {other:?}"),
        }
        // nothing left over, and the decoder is back at a frame boundary
        assert!(decoder.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn three_part_fragmented_text_reassembles_in_order() {
        let mut decoder = upgraded();
        let mask = [1, 2, 3, 4];
        let mut src = BytesMut::new();
        src.extend_from_slice(&client_frame(false, 0x1, mask, b"one "));
        src.extend_from_slice(&client_frame(false, 0x0, mask, b"two "));
        src.extend_from_slice(&client_frame(true, 0x0, mask, b"three"));
        match decoder.decode(&mut src).unwrap() {
            Some(Incoming::Message { binary, payload }) => {
                assert!(!binary);
                assert_eq!(&payload[..], b"one two three");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn byte_at_a_time_input_respects_watermarks() {
        let mut decoder = upgraded();
        let raw = client_frame(true, 0x1, [9, 8, 7, 6], b"drip");
        let mut src = BytesMut::new();
        let mut delivered = None;
        for (i, byte) in raw.iter().enumerate() {
            src.put_u8(*byte);
            let got = decoder.decode(&mut src).unwrap();
            if i + 1 < raw.len() {
                assert!(got.is_none(), "delivered early at byte {i}");
            } else {
                delivered = got;
            }
        }
        match delivered {
            Some(Incoming::Message { payload, .. }) => assert_eq!(&payload[..], b"drip"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sixteen_bit_length_frames_round_trip() {
        let mut decoder = upgraded();
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let mut src = BytesMut::from(&client_frame(true, 0x2, [5, 5, 5, 5], &payload)[..]);
        match decoder.decode(&mut src).unwrap() {
            Some(Incoming::Message { binary, payload: got }) => {
                assert!(binary);
                assert_eq!(&got[..], &payload[..]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reserved_bits_close_the_connection() {
        let mut decoder = upgraded();
        let mut src = BytesMut::from(&[0xc1, 0x80, 0, 0, 0, 0][..]);
        let err = decoder.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol(ProtocolError::ReservedBits(_))
        ));
        assert_eq!(decoder.state(), ReadState::Closed);
    }

    #[test]
    fn unmasked_client_frame_closes_the_connection() {
        let mut decoder = upgraded();
        let mut src = BytesMut::from(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o'][..]);
        let err = decoder.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol(ProtocolError::UnmaskedFrame)
        ));
        assert_eq!(decoder.state(), ReadState::Closed);
    }

    #[test]
    fn reserved_opcode_closes_the_connection() {
        let mut decoder = upgraded();
        let mut src = BytesMut::from(&[0x83, 0x80, 0, 0, 0, 0][..]);
        let err = decoder.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol(ProtocolError::InvalidOpcode(3))
        ));
    }

    #[test]
    fn oversized_declared_payload_closes_the_connection() {
        let mut decoder = upgraded();
        let mut raw = vec![0x82, 0x80 | 127];
        raw.extend_from_slice(&(MAX_PAYLOAD_BYTES + 1).to_be_bytes());
        raw.extend_from_slice(&[0, 0, 0, 0]);
        let mut src = BytesMut::from(&raw[..]);
        let err = decoder.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol(ProtocolError::PayloadTooLarge(_))
        ));
        assert_eq!(decoder.state(), ReadState::Closed);
    }

    #[test]
    fn continuation_without_a_message_closes_the_connection() {
        let mut decoder = upgraded();
        let mut src = BytesMut::from(&client_frame(true, 0x0, [0; 4], b"x")[..]);
        let err = decoder.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol(ProtocolError::UnexpectedContinuation)
        ));
    }

    #[test]
    fn data_frame_during_fragmentation_closes_the_connection() {
        let mut decoder = upgraded();
        let mut src = BytesMut::from(&client_frame(false, 0x1, [0; 4], b"a")[..]);
        assert!(decoder.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&client_frame(true, 0x1, [0; 4], b"b"));
        let err = decoder.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol(ProtocolError::UnfinishedMessage)
        ));
    }

    #[test]
    fn ping_surfaces_its_payload_and_pong_is_ignored() {
        let mut decoder = upgraded();
        let mut src = BytesMut::from(&client_frame(true, 0x9, [1, 1, 1, 1], b"77")[..]);
        match decoder.decode(&mut src).unwrap() {
            Some(Incoming::Ping(payload)) => assert_eq!(&payload[..], b"77"),
            other => panic!("unexpected {other:?}"),
        }

        src.extend_from_slice(&client_frame(true, 0xa, [1, 1, 1, 1], b"77"));
        src.extend_from_slice(&client_frame(true, 0x1, [1, 1, 1, 1], b"after"));
        match decoder.decode(&mut src).unwrap() {
            Some(Incoming::Message { payload, .. }) => assert_eq!(&payload[..], b"after"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn control_frame_between_fragments_does_not_break_reassembly() {
        let mut decoder = upgraded();
        let mut src = BytesMut::new();
        src.extend_from_slice(&client_frame(false, 0x2, [0; 4], &[0x01]));
        src.extend_from_slice(&client_frame(true, 0x9, [0; 4], b"ping"));
        src.extend_from_slice(&client_frame(true, 0x0, [0; 4], &[0x02]));
        match decoder.decode(&mut src).unwrap() {
            Some(Incoming::Ping(payload)) => assert_eq!(&payload[..], b"ping"),
            other => panic!("unexpected {other:?}"),
        }
        match decoder.decode(&mut src).unwrap() {
            Some(Incoming::Message { binary, payload }) => {
                assert!(binary);
                assert_eq!(&payload[..], &[0x01, 0x02]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn close_frame_is_terminal() {
        let mut decoder = upgraded();
        let mut src = BytesMut::from(&client_frame(true, 0x8, [0; 4], &[])[..]);
        assert_eq!(decoder.decode(&mut src).unwrap(), Some(Incoming::Closed));
        assert_eq!(decoder.state(), ReadState::Closed);
        src.extend_from_slice(&client_frame(true, 0x1, [0; 4], b"late"));
        assert!(decoder.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn decoding_before_the_upgrade_is_an_error() {
        let mut decoder = FrameDecoder::new();
        let mut src = BytesMut::from(&[0x81, 0x80][..]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(GatewayError::InvalidState)
        ));
        // no input was consumed
        assert_eq!(src.len(), 2);
    }

    #[test]
    fn ping_payloads_count_up() {
        let mut decoder = upgraded();
        assert_eq!(&decoder.next_ping_payload()[..], b"1");
        assert_eq!(&decoder.next_ping_payload()[..], b"2");
        assert_eq!(&decoder.next_ping_payload()[..], b"3");
    }

    #[test]
    fn encoder_matches_the_frame_writer() {
        let mut encoder = FrameEncoder;
        let mut dst = BytesMut::new();
        encoder
            .encode((OpCode::Text, Bytes::from_static(b"Hello")), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn encoded_frames_decode_after_masking() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let payload: Vec<u8> = (0..2048).map(|_| rng.gen()).collect();
        let mut encoded = BytesMut::new();
        FrameEncoder
            .encode((OpCode::Binary, Bytes::from(payload.clone())), &mut encoded)
            .unwrap();

        // re-mask the server frame as a client would before echoing it back
        let mask: [u8; 4] = rng.gen();
        let header_len = 4; // 126 sentinel + u16 for a 2 KiB payload
        let mut reframed = Vec::new();
        reframed.push(encoded[0]);
        reframed.push(encoded[1] | 0x80);
        reframed.extend_from_slice(&encoded[2..header_len]);
        reframed.extend_from_slice(&mask);
        reframed.extend(
            encoded[header_len..]
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ mask[i & 3]),
        );

        let mut decoder = upgraded();
        let mut src = BytesMut::from(&reframed[..]);
        match decoder.decode(&mut src).unwrap() {
            Some(Incoming::Message { binary, payload: got }) => {
                assert!(binary);
                assert_eq!(&got[..], &payload[..]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
