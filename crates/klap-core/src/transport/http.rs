//! HTTP/1.1 transport over raw TCP.
//!
//! # Note on HTTP Implementation
//!
//! This uses raw TCP sockets instead of an HTTP client library because the
//! devices run a non-compliant HTTP server that rejects requests with
//! lowercase headers. Common HTTP libraries lowercase all header names, while
//! the devices only accept HTTP/1.1 with title-case headers
//! (e.g., "Content-Type" not "content-type").

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::{
    error::Error,
    transport::{HttpResponse, Transport},
};

/// Session cookie name used by KLAP.
pub const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";

/// Upper bound on a response body.
const MAX_BODY_LEN: usize = 1024 * 1024;

/// Upper bound on buffered bytes before the end of the response headers.
const MAX_HEADER_LEN: usize = 16 * 1024;

/// Transport that speaks HTTP/1.1 to a device over a fresh TCP connection per request.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use klap_core::transport::{HttpTransport, Transport};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = HttpTransport::new("192.168.1.100", 80);
///     let response = transport
///         .post("/app/handshake1", &[0u8; 16], None, Duration::from_secs(2))
///         .await?;
///     println!("status {}", response.status);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    host: String,
    port: u16,
}

impl HttpTransport {
    /// Creates a transport for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the device port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Runs one request/response exchange. `io_timeout` bounds the whole
    /// call, not each socket operation.
    async fn exchange(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        io_timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        let deadline = Instant::now() + io_timeout;
        let request = build_request(&self.host, self.port, path, body, cookie);

        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = timeout_at(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {} timed out", addr)))?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;

        timeout_at(deadline, stream.write_all(&request))
            .await
            .map_err(|_| Error::Timeout("write timed out".into()))?
            .map_err(|e| Error::Io(format!("write failed: {}", e)))?;

        let mut response = Vec::with_capacity(1024);
        let mut buf = [0u8; 4096];

        // Read until headers are complete, then until Content-Length is satisfied
        loop {
            let n = read_chunk(&mut stream, &mut buf, deadline).await?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);

            let Some(header_end) = find_header_end(&response) else {
                if response.len() > MAX_HEADER_LEN {
                    return Err(Error::Protocol(format!(
                        "response headers exceed {} bytes",
                        MAX_HEADER_LEN
                    )));
                }
                continue;
            };

            let headers = String::from_utf8_lossy(&response[..header_end]);
            let body_start = header_end + 4;

            if let Some(expected_len) = parse_content_length(&headers) {
                if expected_len > MAX_BODY_LEN {
                    return Err(Error::Protocol(format!(
                        "response too large: {} bytes",
                        expected_len
                    )));
                }

                while response.len() - body_start < expected_len {
                    let n = read_chunk(&mut stream, &mut buf, deadline).await?;
                    if n == 0 {
                        break;
                    }
                    response.extend_from_slice(&buf[..n]);
                }
            }
            break;
        }

        parse_response(&response)
    }
}

async fn read_chunk(stream: &mut TcpStream, buf: &mut [u8], deadline: Instant) -> Result<usize, Error> {
    timeout_at(deadline, stream.read(buf))
        .await
        .map_err(|_| Error::Timeout("read timed out".into()))?
        .map_err(|e| Error::Io(format!("read failed: {}", e)))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        io_timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        debug!(host = %self.host, port = self.port, path, bytes = body.len(), "POST");
        let response = self.exchange(path, body, cookie, io_timeout).await?;
        debug!(
            host = %self.host,
            path,
            status = response.status,
            bytes = response.body.len(),
            "response"
        );
        Ok(response)
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Builds the request bytes with title-case headers.
fn build_request(host: &str, port: u16, path: &str, body: &[u8], cookie: Option<&str>) -> Vec<u8> {
    let mut request = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Length: {}\r\n\
         Accept: */*\r\n",
        path,
        host,
        port,
        body.len()
    );

    if let Some(cookie_value) = cookie {
        request.push_str(&format!(
            "Cookie: {}={}\r\n",
            SESSION_COOKIE_NAME, cookie_value
        ));
    }
    request.push_str("\r\n");

    let mut bytes = request.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Splits a raw response into status, body and session cookie.
fn parse_response(response: &[u8]) -> Result<HttpResponse, Error> {
    let header_end = find_header_end(response)
        .ok_or_else(|| Error::Protocol("invalid HTTP response: no header end".into()))?;

    let headers = String::from_utf8_lossy(&response[..header_end]);
    let status = parse_status_code(&headers)
        .ok_or_else(|| Error::Protocol("invalid HTTP response: no status code".into()))?;

    let mut body = response[header_end + 4..].to_vec();
    if let Some(len) = parse_content_length(&headers) {
        body.truncate(len);
    }

    Ok(HttpResponse {
        status,
        body,
        session_cookie: parse_session_cookie(&headers),
    })
}

/// Find the position of "\r\n\r\n" in the response (end of headers).
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the HTTP status code from the response headers.
fn parse_status_code(headers: &str) -> Option<u16> {
    let first_line = headers.lines().next()?;
    first_line.split_whitespace().nth(1)?.parse().ok()
}

/// Parse the Content-Length header value.
fn parse_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse().ok())?
    })
}

/// Parse the session cookie from the Set-Cookie header.
fn parse_session_cookie(headers: &str) -> Option<String> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("set-cookie") {
            return None;
        }
        // "TP_SESSIONID=value;TIMEOUT=86400"
        value
            .trim()
            .split(';')
            .find_map(|pair| pair.trim().strip_prefix(SESSION_COOKIE_NAME)?.strip_prefix('='))
            .map(str::to_string)
    })
}
