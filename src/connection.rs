//! Per-socket lifecycle.
//!
//! A connection is served by two tasks: the read loop here, which owns the
//! frame decoder and drives the upgrade, and a writer task draining the
//! outbound frame queue that the fan-out table holds a [`SocketHandle`] to.
//! Teardown runs in a fixed order on every exit path: stop I/O by
//! cancelling the connection token, release the socket's subscriptions,
//! then let the writer flush and shut the transport down.

use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{FrameDecoder, FrameEncoder, Incoming};
use crate::envelope::ClientCommand;
use crate::errors::GatewayError;
use crate::frame::OpCode;
use crate::http::{Request, Response};
use crate::protocol;
use crate::pubsub::{SocketHandle, SocketId};
use crate::server::ServerCtx;
use crate::stream::ServerStream;

/// Upper bound on the request head; pre-upgrade clients get no more buffer
/// than this.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024;

/// Liveness probe period once upgraded.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Read inactivity limit; two missed ping periods.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound queue depth per socket; the high-water mark at which a peer
/// that stops draining its socket is disconnected.
pub const OUTPUT_QUEUE_FRAMES: usize = 256;

/// Accept one client socket and serve it to completion.
pub async fn handle<S>(stream: S, id: SocketId, shutdown: CancellationToken, ctx: Rc<ServerCtx>)
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let outcome = match &ctx.tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => serve(ServerStream::Tls(tls), id, shutdown, &ctx).await,
            Err(error) => {
                debug!(socket = %id, %error, "tls handshake failed");
                Ok(())
            }
        },
        None => serve(ServerStream::Plain(stream), id, shutdown, &ctx).await,
    };
    if let Err(error) = outcome {
        debug!(socket = %id, %error, "connection closed");
    }
    ctx.registry.borrow_mut().remove(&id);
}

async fn serve<S>(
    mut stream: ServerStream<S>,
    id: SocketId,
    shutdown: CancellationToken,
    ctx: &Rc<ServerCtx>,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let (head, leftover) = match tokio::time::timeout(IDLE_TIMEOUT, read_head(&mut stream)).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(error)) => {
            if matches!(error, GatewayError::RequestTooLarge(_)) {
                send_response(&mut stream, &plain_reject(400)).await?;
            }
            return Err(error);
        }
        Err(_) => {
            return Err(GatewayError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "request head timed out",
            )))
        }
    };

    let response = match Request::parse(&head) {
        Ok(request) => {
            let mut response = protocol::negotiate(&request);
            if protocol::upgraded(&response) {
                // Carried through for downstream session affinity.
                if let Some(cookie) = request.find_header("Cookie") {
                    response.add_header("Cookie", &cookie.value);
                }
            }
            response
        }
        Err(_) => plain_reject(400),
    };
    send_response(&mut stream, &response).await?;

    if !protocol::upgraded(&response) {
        info!(socket = %id, status = response.status_code, "upgrade rejected");
        let _ = stream.shutdown().await;
        return Ok(());
    }
    info!(socket = %id, "websocket established");

    let mut decoder = FrameDecoder::new();
    decoder.upgrade();

    let (reader, writer) = tokio::io::split(stream);
    let (frame_tx, frame_rx) = mpsc::channel(OUTPUT_QUEUE_FRAMES);
    let writer = tokio::task::spawn_local(write_frames(frame_rx, writer, shutdown.clone()));
    let handle = SocketHandle::new(id, frame_tx, shutdown.clone());

    let mut framed = FramedRead::new(reader, decoder);
    // Bytes the client pipelined behind the upgrade request are frames.
    framed.read_buffer_mut().extend_from_slice(&leftover);

    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut last_read = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(socket = %id, "shutdown requested");
                break;
            }
            _ = ping.tick() => {
                if last_read.elapsed() >= IDLE_TIMEOUT {
                    info!(socket = %id, "idle timeout");
                    break;
                }
                let payload = framed.decoder_mut().next_ping_payload();
                handle.send(OpCode::Ping, payload);
            }
            item = framed.next() => {
                last_read = Instant::now();
                match item {
                    None => {
                        debug!(socket = %id, "peer closed the transport");
                        break;
                    }
                    Some(Err(error)) => {
                        debug!(socket = %id, %error, "frame read failed");
                        break;
                    }
                    Some(Ok(Incoming::Closed)) => {
                        debug!(socket = %id, "close frame received");
                        break;
                    }
                    Some(Ok(Incoming::Ping(payload))) => {
                        handle.send(OpCode::Pong, payload.freeze());
                    }
                    Some(Ok(Incoming::Message { binary: true, .. })) => {
                        info!(socket = %id, "binary frame dropped");
                    }
                    Some(Ok(Incoming::Message { binary: false, payload })) => {
                        on_text(ctx, &handle, &payload);
                    }
                }
            }
        }
    }

    shutdown.cancel();
    if let Err(error) = ctx.manager.borrow_mut().unsubscribe_all(id) {
        warn!(socket = %id, %error, "subscriptions not released");
    }
    drop(handle);
    let _ = writer.await;
    Ok(())
}

/// Route one complete text message to the fan-out manager. Anything that
/// does not parse into a known verb is logged and dropped.
fn on_text(ctx: &ServerCtx, handle: &SocketHandle, payload: &[u8]) {
    let command = match ClientCommand::parse(payload) {
        Ok(command) => command,
        Err(error) => {
            debug!(socket = %handle.id(), %error, "dropping unparseable message");
            return;
        }
    };
    let outcome = match &command {
        ClientCommand::Publish { key, data } => {
            ctx.manager.borrow().publish(key, data.as_bytes())
        }
        ClientCommand::Subscribe { key } => ctx.manager.borrow_mut().subscribe(key, handle),
        ClientCommand::Unsubscribe { key } => {
            ctx.manager.borrow_mut().unsubscribe(key, handle.id())
        }
    };
    if let Err(error) = outcome {
        debug!(socket = %handle.id(), %error, ?command, "command not applied");
    }
}

/// Drain the outbound queue onto the transport, then shut it down. Frames
/// already queued when shutdown fires are still flushed.
async fn write_frames<W>(
    mut frames: mpsc::Receiver<(OpCode, Bytes)>,
    writer: W,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, FrameEncoder);
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
    let mut writer = framed.into_inner();
    let _ = writer.shutdown().await;
}

/// Read until the blank line ending the request head, returning the head
/// and whatever the client sent after it.
async fn read_head<S>(stream: &mut S) -> Result<(BytesMut, BytesMut), GatewayError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_blank_line(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            return Err(GatewayError::RequestTooLarge(MAX_REQUEST_BYTES));
        }
        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(GatewayError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed before completing the request",
            )));
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn plain_reject(status_code: u16) -> Response {
    let mut response = Response::new(status_code);
    response.add_header("Connection", "Close");
    response
}

async fn send_response<S>(stream: &mut S, response: &Response) -> Result<(), GatewayError>
where
    S: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    response.write(&mut out);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_line_is_found_with_trailing_bytes() {
        assert_eq!(find_blank_line(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_blank_line(b"GET / HTTP/1.1\r\n\r\nXYZ"), Some(18));
        assert_eq!(find_blank_line(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_blank_line(b""), None);
    }

    #[tokio::test]
    async fn read_head_splits_head_from_pipelined_frames() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n\x81\x80")
            .await
            .unwrap();
        let (head, rest) = read_head(&mut server).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(&rest[..], &[0x81, 0x80]);
    }

    #[tokio::test]
    async fn read_head_rejects_oversized_requests() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let big = vec![b'a'; MAX_REQUEST_BYTES + 1];
        client.write_all(&big).await.unwrap();
        let err = read_head(&mut server).await.unwrap_err();
        assert!(matches!(err, GatewayError::RequestTooLarge(_)));
    }

    #[tokio::test]
    async fn read_head_reports_early_eof() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HT").await.unwrap();
        drop(client);
        let err = read_head(&mut server).await.unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
    }
}
