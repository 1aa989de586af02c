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

use std::net::SocketAddr;

use anyhow::Result;
use http::{
    header::{CONNECTION, CONTENT_TYPE},
    HeaderMap, HeaderValue, Method, StatusCode, Version,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use super::{
    dispatch::Dispatcher,
    flow::ResponseParts,
    http1::{self, enforce_content_length},
};
use crate::utils::ProxyError;

/// Serves one client connection until it closes, asks to close, or sends something
/// unparseable. Requests on a connection are answered strictly in order.
pub async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    max_body: Option<usize>,
) -> Result<()> {
    let _ = socket.set_nodelay(true);
    let (read_half, write_half) = socket.into_split();
    serve_stream(read_half, write_half, peer, dispatcher, max_body).await
}

/// Request loop over any split byte stream.
pub async fn serve_stream<R, W>(
    read_half: R,
    mut write_half: W,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    max_body: Option<usize>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(read_half);

    loop {
        let request = match http1::read_request(&mut reader, max_body).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!(%peer, "client closed connection");
                return Ok(());
            }
            Err(err) => {
                let response = rejection(&err);
                tracing::debug!(%peer, status = %response.status, error = %format!("{err:#}"), "rejecting request");
                http1::write_response(&mut write_half, &response).await?;
                let _ = write_half.shutdown().await;
                return Ok(());
            }
        };

        let keep_alive = http1::wants_keep_alive(request.version, &request.headers);
        let is_head = request.method == Method::HEAD;
        let source_id = source_identity(&request.headers, peer);
        tracing::debug!(%peer, method = %request.method, uri = %request.uri, "parsed request");

        let mut response = tokio::select! {
            response = dispatcher.dispatch(request, &source_id) => response,
            _ = client_gone(&mut reader) => {
                tracing::debug!(%peer, "client went away mid-request, dropping upstream work");
                return Ok(());
            }
        };

        response.version = Version::HTTP_11;
        if is_head {
            // Headers, including the computed length, stay; the bytes never go out.
            response.body.replace(&[]);
        }
        response.headers.insert(
            CONNECTION,
            HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
        );
        http1::write_response(&mut write_half, &response).await?;

        if !keep_alive {
            let _ = write_half.shutdown().await;
            return Ok(());
        }
    }
}

/// Resolves once the client has hung up. Pipelined bytes stay buffered for the next read.
async fn client_gone<R>(reader: &mut R)
where
    R: AsyncBufRead + Unpin,
{
    match reader.fill_buf().await {
        Ok([]) | Err(_) => {}
        Ok(_) => std::future::pending::<()>().await,
    }
}

/// History key for the request: the first `X-Forwarded-For` hop when fronted by another
/// proxy, else the peer IP.
pub fn source_identity(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

fn rejection(err: &anyhow::Error) -> ResponseParts {
    let (status, message) = match err.downcast_ref::<ProxyError>() {
        Some(ProxyError::BodyTooLarge { limit }) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {limit} bytes\n"),
        ),
        _ => (StatusCode::BAD_REQUEST, "malformed request\n".to_string()),
    };

    let mut response = ResponseParts::new(status);
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
        .headers
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response.body.push_bytes(message.as_bytes());
    if let Err(err) = enforce_content_length(&mut response) {
        tracing::warn!(error = %err, "failed to frame rejection response");
    }
    response
}
