/*!
 * # Request Framing Module
 *
 * Operates on the raw octet buffer read from the client: reading up to the
 * header terminator, parsing the request line and headers, extracting the
 * destination authority, and rewriting hop-by-hop headers for egress.
 *
 * Parsing is deliberately tolerant: unknown methods pass through, header
 * lines without a colon are skipped, and later occurrences of a header
 * overwrite earlier ones.
 */

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::{ProxyError, Result};

/// Chunk size used while reading the request head
const HEAD_CHUNK: usize = 1024;

/// Upper bound on the request head; anything larger is treated as malformed
const MAX_HEAD: usize = 64 * 1024;

/// Read from the client until the `\r\n\r\n` head terminator appears
///
/// Reads in 1024-octet chunks, applying `read_timeout` to each chunk. The
/// returned buffer contains the complete head plus any body octets that
/// arrived with it.
///
/// # Arguments
///
/// * `stream` - The client stream to read from
/// * `read_timeout` - Per-chunk read deadline
///
/// # Returns
///
/// The raw request bytes, or `ClientHeaderTimeout` / `ClientClosed` /
/// `MalformedRequest` when the head never completes
pub async fn read_head<R>(stream: &mut R, read_timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut request = Vec::with_capacity(HEAD_CHUNK);
    let mut chunk = [0u8; HEAD_CHUNK];

    loop {
        let n = match timeout(read_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(ProxyError::ClientClosed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ProxyError::Io(e)),
            Err(_) => return Err(ProxyError::ClientHeaderTimeout),
        };
        request.extend_from_slice(&chunk[..n]);

        if head_end(&request).is_some() {
            return Ok(request);
        }
        if request.len() > MAX_HEAD {
            return Err(ProxyError::MalformedRequest);
        }
    }
}

/// Index just past the first `\r\n\r\n`, if the buffer contains one
pub fn head_end(request: &[u8]) -> Option<usize> {
    request
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Body octets that arrived together with the head
pub fn body_fragment(request: &[u8]) -> &[u8] {
    match head_end(request) {
        Some(end) => &request[end..],
        None => &[],
    }
}

/// Split the request line into `(METHOD, target)`
///
/// The method is uppercased; the target is the second whitespace-separated
/// token or the empty string. Fails with `MalformedRequest` when no method
/// can be extracted.
pub fn request_line(request: &[u8]) -> Result<(String, String)> {
    let line_end = request
        .windows(2)
        .position(|window| window == b"\r\n")
        .unwrap_or(request.len());
    let line = String::from_utf8_lossy(&request[..line_end]);

    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or(ProxyError::MalformedRequest)?;
    let target = parts.next().unwrap_or("");

    Ok((method.to_ascii_uppercase(), target.to_string()))
}

/// Parse the header block into a name → value map
///
/// Names are title-cased for lookup (`proxy-authorization` →
/// `Proxy-Authorization`); later occurrences of a name overwrite earlier
/// ones. Lines without a colon are ignored.
pub fn parse_headers(request: &[u8]) -> HashMap<String, String> {
    let head = match head_end(request) {
        Some(end) => &request[..end - 4],
        None => request,
    };

    let mut headers = HashMap::new();
    for line in head.split(|&b| b == b'\n').skip(1) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(title_case(name.trim()), value.trim().to_string());
        }
    }
    headers
}

/// Destination host and port from the `Host` header, default port 80
pub fn host_port(headers: &HashMap<String, String>) -> Option<(String, u16)> {
    parse_authority(headers.get("Host")?, 80)
}

/// Parse an authority of the form `host[:port][/...]`
///
/// The authority ends at the first `/` when one is present. Returns `None`
/// for an empty host or an unparseable port.
pub fn parse_authority(target: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = match target.find('/') {
        Some(pos) => &target[..pos],
        None => target,
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (authority, default_port),
    };

    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Declared body length, 0 when absent or non-numeric
pub fn content_length(headers: &HashMap<String, String>) -> usize {
    headers
        .get("Content-Length")
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Rewrite a request for the origin hop
///
/// Removes every `Proxy-Authorization`, `Proxy-Connection` and `Connection`
/// line and appends exactly one `Connection: close`. The request line and
/// body are preserved bit-exact. A request without a head terminator is
/// returned unchanged.
pub fn rewrite_for_origin(request: &[u8]) -> Vec<u8> {
    let Some(end) = head_end(request) else {
        return request.to_vec();
    };
    let head = &request[..end - 4];
    let body = &request[end..];

    let mut lines = head.split(|&b| b == b'\n').map(|line| {
        match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        }
    });

    let mut rewritten = Vec::with_capacity(request.len() + 32);
    if let Some(request_line) = lines.next() {
        rewritten.extend_from_slice(request_line);
        rewritten.extend_from_slice(b"\r\n");
    }
    for line in lines {
        if header_named(line, b"proxy-authorization")
            || header_named(line, b"proxy-connection")
            || header_named(line, b"connection")
        {
            continue;
        }
        rewritten.extend_from_slice(line);
        rewritten.extend_from_slice(b"\r\n");
    }
    rewritten.extend_from_slice(b"Connection: close\r\n\r\n");
    rewritten.extend_from_slice(body);
    rewritten
}

/// True when the header line carries the given (lowercase) name
fn header_named(line: &[u8], name: &[u8]) -> bool {
    line.len() > name.len()
        && line[name.len()] == b':'
        && line[..name.len()].eq_ignore_ascii_case(name)
}

/// Title-case a header name the way it is written on the wire
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_word_start = true;
    for c in name.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}
