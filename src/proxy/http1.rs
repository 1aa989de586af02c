/* yxorp (AGPL-3.0)

Copyright (C) 2025 - yxorp Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! Minimal HTTP/1.x framing shared by the client-facing and upstream sides.
//!
//! Both directions are fully buffered: requests and responses are read into
//! [`RequestParts`] / [`ResponseParts`] with their bodies de-chunked, and written back
//! out with an explicit `Content-Length`.

use anyhow::{bail, Context, Result};
use http::{
    header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    HeaderMap, Method, StatusCode, Uri, Version,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::flow::{BodyBuffer, RequestParts, ResponseParts};
use crate::utils::ProxyError;

/// Upper bound for the request/status line plus all header lines.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Connection-scoped headers that never cross the proxy.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-authenticate",
];

/// Reads one request off a client connection. `Ok(None)` means the peer closed the
/// connection cleanly before sending anything.
pub async fn read_request<R>(reader: &mut R, max_body: Option<usize>) -> Result<Option<RequestParts>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head_budget = MAX_HEAD_BYTES;
    let mut line = Vec::new();

    // Tolerate stray CRLFs between pipelined requests.
    loop {
        line.clear();
        if read_head_line(reader, &mut line, &mut head_budget).await? == 0 {
            return Ok(None);
        }
        if !trim_crlf(&line).is_empty() {
            break;
        }
    }

    let request_line = std::str::from_utf8(trim_crlf(&line)).context("request line is not UTF-8")?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 {
        bail!(ProxyError::Protocol(format!("malformed request line: {request_line:?}")));
    }

    let method = parts[0]
        .parse::<Method>()
        .with_context(|| format!("invalid method: {}", parts[0]))?;
    let uri = parts[1]
        .parse::<Uri>()
        .with_context(|| format!("invalid request target: {}", parts[1]))?;
    let version = parse_version(parts[2]);

    let headers = read_headers(reader, &mut head_budget).await?;

    let mut body = BodyBuffer::default();
    if has_chunked_encoding(&headers) {
        read_chunked_body(reader, &mut body, max_body).await?;
    } else if let Some(len) = content_length(&headers)? {
        check_limit(len, max_body)?;
        read_fixed_body(reader, len, &mut body).await?;
    }

    Ok(Some(RequestParts {
        method,
        uri,
        version,
        headers,
        body,
    }))
}

/// Reads a complete upstream response. Chunked bodies are de-chunked and the headers are
/// normalized to a plain `Content-Length`.
pub async fn read_response<R>(
    reader: &mut R,
    request_method: &Method,
    max_body: Option<usize>,
) -> Result<ResponseParts>
where
    R: AsyncBufRead + Unpin,
{
    let mut head_budget = MAX_HEAD_BYTES;
    let mut line = Vec::new();

    loop {
        line.clear();
        if read_head_line(reader, &mut line, &mut head_budget).await? == 0 {
            bail!("upstream closed connection before sending status line");
        }
        let status_line = std::str::from_utf8(trim_crlf(&line)).context("status line is not UTF-8")?;
        let mut parts = status_line.splitn(3, ' ');
        let version_str = parts.next().context("response line missing HTTP version")?;
        let status_str = parts.next().context("response line missing status code")?;

        let status_code: u16 = status_str
            .parse()
            .with_context(|| format!("invalid status code: {status_str}"))?;
        let status = StatusCode::from_u16(status_code)
            .with_context(|| format!("unsupported status code: {status_code}"))?;
        let version = parse_version(version_str);
        let mut headers = read_headers(reader, &mut head_budget).await?;

        // Interim responses (100 Continue, 103 Early Hints) are swallowed.
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            tracing::trace!(%status, "skipping interim upstream response");
            continue;
        }

        let mut body = BodyBuffer::default();
        match response_body_encoding(&headers, &status, request_method)? {
            BodyEncoding::None => {}
            BodyEncoding::ContentLength(len) => {
                check_limit(len, max_body)?;
                read_fixed_body(reader, len, &mut body).await?;
            }
            BodyEncoding::Chunked => {
                read_chunked_body(reader, &mut body, max_body).await?;
                normalize_content_length(&mut headers, body.len())?;
            }
            BodyEncoding::UntilClose => {
                read_until_close(reader, &mut body, max_body).await?;
                normalize_content_length(&mut headers, body.len())?;
            }
        }

        return Ok(ResponseParts {
            status,
            version,
            headers,
            body,
        });
    }
}

/// Serializes a request for upstream. `request_target` is the origin-form path to put on
/// the request line; the body is sent with an explicit length.
pub async fn write_request<W>(upstream: &mut W, req: &RequestParts, request_target: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method, request_target).as_bytes());

    for (name, value) in &req.headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        push_header(&mut head, name, value);
    }
    if !req.body.is_empty() || method_expects_body(&req.method) {
        head.extend_from_slice(format!("content-length: {}\r\n", req.body.len()).as_bytes());
    }
    head.extend_from_slice(b"\r\n");

    upstream.write_all(&head).await?;
    if !req.body.is_empty() {
        upstream.write_all(req.body.as_bytes()).await?;
    }
    upstream.flush().await?;
    Ok(())
}

/// Serializes a response for the client. Callers run [`enforce_content_length`] first.
pub async fn write_response<W>(client: &mut W, response: &ResponseParts) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = response.status.canonical_reason().unwrap_or("");
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            version_label(response.version),
            response.status.as_u16(),
            reason
        )
        .as_bytes(),
    );
    for (name, value) in &response.headers {
        push_header(&mut head, name, value);
    }
    head.extend_from_slice(b"\r\n");

    client.write_all(&head).await?;
    if !response.body.is_empty() {
        client.write_all(response.body.as_bytes()).await?;
    }
    client.flush().await?;
    Ok(())
}

/// Replaces any framing headers with a `Content-Length` matching the buffered body.
/// `204` and `304` carry neither a body nor a length.
pub fn enforce_content_length(response: &mut ResponseParts) -> Result<()> {
    if matches!(response.status, StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED) {
        response.headers.remove(TRANSFER_ENCODING);
        response.headers.remove(CONTENT_LENGTH);
        response.body.replace(&[]);
        return Ok(());
    }
    normalize_content_length(&mut response.headers, response.body.len())
}

/// Drops hop-by-hop headers, including any listed in the `Connection` header itself.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in HOP_BY_HOP_HEADERS.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

/// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close; an explicit header wins.
pub fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let tokens: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect();

    if tokens.iter().any(|token| token == "close") {
        return false;
    }
    if tokens.iter().any(|token| token == "keep-alive") {
        return true;
    }
    version == Version::HTTP_11
}

async fn read_headers<R>(reader: &mut R, head_budget: &mut usize) -> Result<HeaderMap>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if read_head_line(reader, &mut line, head_budget).await? == 0 {
            bail!("unexpected EOF while reading headers");
        }
        let trimmed = trim_crlf(&line);
        if trimmed.is_empty() {
            break;
        }
        let Some(colon_pos) = trimmed.iter().position(|b| *b == b':') else {
            tracing::trace!("ignoring header line without colon");
            continue;
        };
        let name = trim_ascii_ws(&trimmed[..colon_pos]);
        let value = trim_ascii_ws(&trimmed[colon_pos + 1..]);
        match (HeaderName::from_bytes(name), HeaderValue::from_bytes(value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::trace!("ignoring unparsable header line"),
        }
    }
    Ok(headers)
}

async fn read_head_line<R>(reader: &mut R, line: &mut Vec<u8>, head_budget: &mut usize) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader)
        .take(*head_budget as u64 + 1)
        .read_until(b'\n', line)
        .await?;
    if read > *head_budget {
        bail!(ProxyError::Protocol(format!(
            "message head exceeds {MAX_HEAD_BYTES} bytes"
        )));
    }
    *head_budget -= read;
    Ok(read)
}

async fn read_fixed_body<R>(reader: &mut R, len: usize, body: &mut BodyBuffer) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    copy_exact(reader, len, body)
        .await
        .with_context(|| format!("expected {len} body bytes, hit EOF"))
}

/// Moves exactly `len` bytes into `body` as they arrive. The buffer only grows by what
/// the peer actually sent, never by what it claimed.
async fn copy_exact<R>(reader: &mut R, len: usize, body: &mut BodyBuffer) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            bail!("unexpected EOF with {remaining} bytes outstanding");
        }
        let take = available.len().min(remaining);
        body.push_bytes(&available[..take]);
        reader.consume(take);
        remaining -= take;
    }
    Ok(())
}

async fn read_chunked_body<R>(reader: &mut R, body: &mut BodyBuffer, max_body: Option<usize>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut size_line = String::new();
        let read = reader
            .read_line(&mut size_line)
            .await
            .context("failed to read chunk size line")?;
        if read == 0 {
            bail!("unexpected EOF while reading chunk size");
        }

        let size_str = size_line.trim_end_matches(&['\r', '\n'][..]);
        let size_token = size_str.split(';').next().unwrap_or(size_str).trim();
        let size = usize::from_str_radix(size_token, 16)
            .with_context(|| format!("invalid chunk size: {size_token}"))?;

        if size == 0 {
            consume_trailer_section(reader).await?;
            break;
        }
        let total = body
            .len()
            .checked_add(size)
            .ok_or_else(|| ProxyError::Protocol(format!("chunk size {size_token} overflows body length")))?;
        check_limit(total, max_body)?;

        copy_exact(reader, size, body)
            .await
            .with_context(|| format!("expected {size} chunk bytes, hit EOF"))?;

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .context("failed to read chunk terminator")?;
        if crlf != [b'\r', b'\n'] {
            bail!("chunk missing CRLF terminator");
        }
    }
    Ok(())
}

async fn consume_trailer_section<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 || trim_crlf(&line).is_empty() {
            break;
        }
    }
    Ok(())
}

async fn read_until_close<R>(reader: &mut R, body: &mut BodyBuffer, max_body: Option<usize>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    match max_body {
        Some(limit) => {
            (&mut *reader).take(limit as u64 + 1).read_to_end(&mut buf).await?;
            check_limit(buf.len(), max_body)?;
        }
        None => {
            reader.read_to_end(&mut buf).await?;
        }
    }
    body.push_bytes(&buf);
    Ok(())
}

fn trim_crlf(input: &[u8]) -> &[u8] {
    let mut end = input.len();
    while end > 0 && matches!(input[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &input[..end]
}

fn trim_ascii_ws(input: &[u8]) -> &[u8] {
    let start = input.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(input.len());
    let end = input.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |idx| idx + 1);
    &input[start..end.max(start)]
}

fn parse_version(raw: &str) -> Version {
    match raw {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/2.0" | "HTTP/2" => Version::HTTP_2,
        _ => Version::HTTP_11,
    }
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn push_header(head: &mut Vec<u8>, name: &HeaderName, value: &HeaderValue) {
    head.extend_from_slice(name.as_str().as_bytes());
    head.extend_from_slice(b": ");
    head.extend_from_slice(value.as_bytes());
    head.extend_from_slice(b"\r\n");
}

fn method_expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn check_limit(len: usize, max_body: Option<usize>) -> Result<()> {
    match max_body {
        Some(limit) if len > limit => Err(ProxyError::BodyTooLarge { limit }.into()),
        _ => Ok(()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum BodyEncoding {
    None,
    ContentLength(usize),
    Chunked,
    UntilClose,
}

fn response_body_encoding(headers: &HeaderMap, status: &StatusCode, method: &Method) -> Result<BodyEncoding> {
    if method == Method::HEAD || status.is_informational() {
        return Ok(BodyEncoding::None);
    }
    if matches!(status.as_u16(), 204 | 205 | 304) {
        return Ok(BodyEncoding::None);
    }
    if has_chunked_encoding(headers) {
        return Ok(BodyEncoding::Chunked);
    }
    match content_length(headers)? {
        Some(len) => Ok(BodyEncoding::ContentLength(len)),
        None => Ok(BodyEncoding::UntilClose),
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(None);
    };
    let raw = value.to_str().context("non-ASCII content-length")?;
    // Duplicate identical values folded into one header ("12, 12") are tolerated.
    let mut lengths = raw.split(',').map(|part| part.trim().parse::<usize>());
    let first = lengths
        .next()
        .transpose()
        .with_context(|| format!("invalid content-length: {raw}"))?;
    for other in lengths {
        let other = other.with_context(|| format!("invalid content-length: {raw}"))?;
        if Some(other) != first {
            bail!(ProxyError::Protocol(format!("conflicting content-length: {raw}")));
        }
    }
    Ok(first)
}

fn has_chunked_encoding(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|raw| {
            raw.to_ascii_lowercase()
                .split(',')
                .any(|enc| enc.trim() == "chunked")
        })
}

fn normalize_content_length(headers: &mut HeaderMap, len: usize) -> Result<()> {
    headers.remove(TRANSFER_ENCODING);
    let value = HeaderValue::from_str(&len.to_string()).context("invalid content-length value")?;
    headers.insert(CONTENT_LENGTH, value);
    Ok(())
}
