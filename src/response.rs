/*!
 * # Response Module
 *
 * Builds complete HTTP/1.1 responses as single octet sequences and holds the
 * protocol constants shared by the proxy and the manager. The builder only
 * produces bytes; callers that need to inspect a response again (tests,
 * mostly) parse it separately.
 */

use http::StatusCode;
use serde::Serialize;

use crate::error::Result;

/// Bytes sent to the client once a CONNECT tunnel is open
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Terminator between an HTTP head and its body
pub const FINISHED: &[u8] = b"\r\n\r\n";

/// Build the CONNECT request line re-issued to an upstream proxy
pub fn connect_line(target: &str) -> Vec<u8> {
    format!("CONNECT {} HTTP/1.1\r\n\r\n", target).into_bytes()
}

/// Response body payload
///
/// Raw octets pass through unchanged, text is sent as UTF-8 plain text and
/// JSON values are serialized. The matching default `Content-Type` is set
/// only when the caller did not supply one.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Text(String),
    Json(Vec<u8>),
}

impl Body {
    /// Serialize a JSON-representable value into a response body
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Body::Json(serde_json::to_vec(value)?))
    }

    fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Body::Empty => None,
            Body::Bytes(_) => Some("application/octet-stream"),
            Body::Text(_) => Some("text/plain; charset=utf-8"),
            Body::Json(_) => Some("application/json; charset=utf-8"),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Body::Empty => Vec::new(),
            Body::Bytes(bytes) => bytes,
            Body::Text(text) => text.into_bytes(),
            Body::Json(bytes) => bytes,
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

/// Encode a complete HTTP/1.1 response
///
/// The status line uses the IANA-registered reason phrase for the code.
/// Header insertion order is preserved on the wire; `Content-Type` defaults
/// from the body kind unless already supplied, and `Content-Length` is
/// stamped from the body's octet length whenever the body is non-empty,
/// overriding any caller-supplied value.
///
/// # Arguments
///
/// * `status` - HTTP status code to send to the client
/// * `body` - Response body payload
/// * `headers` - Response headers, in the order they should appear
///
/// # Returns
///
/// The full response as one octet sequence, ready to be written to a socket
pub fn encode_response(status: u16, body: Body, headers: &[(&str, &str)]) -> Vec<u8> {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown");

    let mut header_list: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    if let Some(content_type) = body.default_content_type() {
        if !has_header(&header_list, "Content-Type") {
            header_list.push(("Content-Type".to_string(), content_type.to_string()));
        }
    }

    let body_bytes = body.into_bytes();
    if !body_bytes.is_empty() {
        set_header(
            &mut header_list,
            "Content-Length",
            body_bytes.len().to_string(),
        );
    }

    let mut raw = format!("HTTP/1.1 {} {}\r\n", status, reason).into_bytes();
    for (name, value) in &header_list {
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&body_bytes);
    raw
}

/// The exact 407 challenge sent when proxy authentication fails
pub fn proxy_auth_required() -> Vec<u8> {
    encode_response(
        407,
        Body::Text("Proxy Authentication Required".to_string()),
        &[
            ("Proxy-Authenticate", "Basic realm=\"Proxy\""),
            ("Content-Type", "text/plain; charset=utf-8"),
            ("Connection", "close"),
        ],
    )
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Split a response back into (status, headers, body) for assertions
    fn parse(raw: &[u8]) -> (u16, Vec<(String, String)>, Vec<u8>) {
        let pos = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("no head terminator");
        let head = std::str::from_utf8(&raw[..pos]).unwrap();
        let body = raw[pos + 4..].to_vec();

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap();
        let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();

        let headers = lines
            .map(|line| {
                let (name, value) = line.split_once(':').unwrap();
                (name.trim().to_string(), value.trim().to_string())
            })
            .collect();

        (status, headers, body)
    }

    #[test]
    fn test_empty_body_has_no_length() {
        let raw = encode_response(403, Body::Empty, &[("Connection", "close")]);
        assert_eq!(raw, b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\n\r\n");
    }

    #[test]
    fn test_reason_phrase_from_code() {
        let raw = encode_response(502, Body::Empty, &[]);
        assert!(raw.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[test]
    fn test_text_body_round_trip() {
        let raw = encode_response(200, Body::from("hello"), &[]);
        let (status, headers, body) = parse(&raw);
        assert_eq!(status, 200);
        assert_eq!(body, b"hello");
        assert!(headers.contains(&("Content-Type".into(), "text/plain; charset=utf-8".into())));
        assert!(headers.contains(&("Content-Length".into(), "5".into())));
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let body = Body::json(&json!({"status": "ok"})).unwrap();
        let raw = encode_response(200, body, &[]);
        let (_, headers, body) = parse(&raw);
        assert!(headers.contains(&(
            "Content-Type".into(),
            "application/json; charset=utf-8".into()
        )));
        assert_eq!(body, br#"{"status":"ok"}"#);
    }

    #[test]
    fn test_caller_content_type_wins() {
        let raw = encode_response(
            200,
            Body::from("x"),
            &[("Content-Type", "text/html; charset=utf-8")],
        );
        let (_, headers, _) = parse(&raw);
        let content_types: Vec<_> = headers.iter().filter(|(n, _)| n == "Content-Type").collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(content_types[0].1, "text/html; charset=utf-8");
    }

    #[test]
    fn test_content_length_cannot_be_overridden() {
        let raw = encode_response(200, Body::from("hello"), &[("Content-Length", "999")]);
        let (_, headers, _) = parse(&raw);
        let lengths: Vec<_> = headers.iter().filter(|(n, _)| n == "Content-Length").collect();
        assert_eq!(lengths.len(), 1);
        assert_eq!(lengths[0].1, "5");
    }

    #[test]
    fn test_proxy_auth_required_exact_bytes() {
        let expected = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
            Proxy-Authenticate: Basic realm=\"Proxy\"\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            Connection: close\r\n\
            Content-Length: 29\r\n\
            \r\n\
            Proxy Authentication Required";
        assert_eq!(proxy_auth_required(), expected);
    }

    #[test]
    fn test_connect_line() {
        assert_eq!(
            connect_line("example.org:443"),
            b"CONNECT example.org:443 HTTP/1.1\r\n\r\n"
        );
    }
}
