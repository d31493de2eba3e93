//! WebSocket opening handshake (RFC 6455 §4).
//!
//! [`negotiate`] inspects a parsed upgrade request and produces the complete
//! response: `101 Switching Protocols` with the accept token on success, or
//! the precise rejection status otherwise. Every rejection carries
//! `Connection: Close` so the caller can flush and tear the socket down.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::http::{Request, Response};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` token: Base64(SHA-1(key || GUID)).
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    BASE64.encode(sha1.finalize())
}

fn reject(status_code: u16) -> Response {
    let mut resp = Response::new(status_code);
    resp.add_header("Connection", "Close");
    resp
}

/// Validate the upgrade request and build the response for it.
///
/// The checks run in order and the first failure wins:
///
/// 1. `HTTP/1.x` with `x >= 1`, else 505;
/// 2. `Upgrade: websocket` (case-insensitive), else 400;
/// 3. `Connection: upgrade` (case-insensitive), else 400;
/// 4. an `Origin` header present, else 403 — no allow-list is enforced
///    here, that is a reverse-proxy concern;
/// 5. `Sec-WebSocket-Version: 13`, else 400 advertising the version;
/// 6. `Sec-WebSocket-Key` present, else 400.
pub fn negotiate(req: &Request) -> Response {
    if req.version_major != 1 || req.version_minor < 1 {
        return reject(505);
    }

    let upgrade = req.find_header("Upgrade");
    if !matches!(upgrade, Some(h) if h.value.eq_ignore_ascii_case("websocket")) {
        return reject(400);
    }

    let connection = req.find_header("Connection");
    if !matches!(connection, Some(h) if h.value.eq_ignore_ascii_case("upgrade")) {
        return reject(400);
    }

    if req.find_header("Origin").is_none() {
        return reject(403);
    }

    let version = req.find_header("Sec-WebSocket-Version");
    if !matches!(version, Some(h) if h.value == "13") {
        let mut resp = reject(400);
        resp.add_header("Sec-WebSocket-Version", "13");
        return resp;
    }

    let key = match req.find_header("Sec-WebSocket-Key") {
        Some(h) => h.value.clone(),
        None => return reject(400),
    };

    let mut resp = Response::new(101);
    resp.add_header("Connection", "Upgrade");
    resp.add_header("Upgrade", "websocket");
    resp.add_header("Sec-WebSocket-Accept", &accept_key(&key));
    resp
}

/// Whether a [`negotiate`] response upgraded the connection.
pub fn upgraded(resp: &Response) -> bool {
    resp.status_code == 101
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;
    use bytes::BytesMut;

    fn request(raw: &[u8]) -> Request {
        Request::parse(raw).unwrap()
    }

    const SAMPLE: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Origin: http://example.com\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        \r\n";

    #[test]
    fn rfc6455_sample_key_produces_the_documented_accept() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn accept_tokens_decode_back_to_twenty_digest_bytes() {
        for key in ["dGhlIHNhbXBsZSBub25jZQ==", "", "anything goes here"] {
            let token = accept_key(key);
            let digest = BASE64.decode(&token).expect("valid base64");
            assert_eq!(digest.len(), 20);
            assert_eq!(BASE64.encode(&digest), token);
        }
        // decoding rejects inputs whose length is not a multiple of four
        assert!(BASE64.decode("abc").is_err());
    }

    #[test]
    fn valid_upgrade_yields_switching_protocols() {
        let resp = negotiate(&request(SAMPLE));
        assert!(upgraded(&resp));
        assert_eq!(
            resp.find_header("Sec-WebSocket-Accept").unwrap().value,
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(resp.find_header("Upgrade").unwrap().value, "websocket");
        assert_eq!(resp.find_header("Connection").unwrap().value, "Upgrade");

        let mut out = BytesMut::new();
        resp.write(&mut out);
        assert!(out.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
    }

    #[test]
    fn old_http_version_gets_505() {
        let raw = b"GET /chat HTTP/1.0\r\nHost: example.com\r\n\r\n";
        let resp = negotiate(&request(raw));
        assert_eq!(resp.status_code, 505);
        assert_eq!(resp.find_header("Connection").unwrap().value, "Close");
    }

    #[test]
    fn missing_or_wrong_upgrade_header_gets_400() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\n\r\n";
        assert_eq!(negotiate(&request(raw)).status_code, 400);

        let raw =
            b"GET /chat HTTP/1.1\r\nHost: e\r\nUpgrade: h2c\r\nConnection: Upgrade\r\n\r\n";
        assert_eq!(negotiate(&request(raw)).status_code, 400);
    }

    #[test]
    fn upgrade_header_value_is_case_insensitive() {
        let raw = b"GET /chat HTTP/1.1\r\n\
            Host: example.com\r\n\
            Upgrade: WebSocket\r\n\
            Connection: UPGRADE\r\n\
            Origin: http://example.com\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";
        assert!(upgraded(&negotiate(&request(raw))));
    }

    #[test]
    fn missing_origin_gets_403() {
        let raw = b"GET /chat HTTP/1.1\r\n\
            Host: example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";
        let resp = negotiate(&request(raw));
        assert_eq!(resp.status_code, 403);
        assert_eq!(resp.find_header("Connection").unwrap().value, "Close");
    }

    #[test]
    fn wrong_version_gets_400_and_advertises_13() {
        let raw = b"GET /chat HTTP/1.1\r\n\
            Host: example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Origin: http://example.com\r\n\
            Sec-WebSocket-Version: 8\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";
        let resp = negotiate(&request(raw));
        assert_eq!(resp.status_code, 400);
        assert_eq!(
            resp.find_header("Sec-WebSocket-Version").unwrap().value,
            "13"
        );
    }

    #[test]
    fn missing_key_gets_400() {
        let raw = b"GET /chat HTTP/1.1\r\n\
            Host: example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Origin: http://example.com\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";
        assert_eq!(negotiate(&request(raw)).status_code, 400);
    }
}
