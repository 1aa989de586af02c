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

use http::{header::CONTENT_LENGTH, StatusCode};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use yxorp::{
    address::TargetAddress,
    config::UpstreamConfig,
    proxy::{Upstream, UpstreamClient},
    utils::ProxyError,
};

use crate::support::get;

/// Accepts one connection, captures the request head and answers with `reply`.
async fn one_shot_origin(reply: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let mut head = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
            head.push(line.trim_end().to_string());
        }
        write_half.write_all(reply).await.unwrap();
        write_half.shutdown().await.unwrap();
        head
    });
    (port, handle)
}

#[tokio::test]
async fn fetches_and_dechunks_plain_http() {
    let (port, origin) = one_shot_origin(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;

    let client = UpstreamClient::new(&UpstreamConfig::default(), None);
    let target = TargetAddress::new("http", "127.0.0.1", Some(port), "/greeting?lang=en");
    let response = client.fetch(&get("/ignored"), &target).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_bytes(), b"hello world");
    assert_eq!(response.headers[CONTENT_LENGTH], "11");

    let head = origin.await.unwrap();
    assert_eq!(head[0], "GET /greeting?lang=en HTTP/1.1");
}

#[tokio::test]
async fn oversized_upstream_body_is_rejected() {
    let (port, _origin) =
        one_shot_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 32\r\n\r\n0123456789abcdef0123456789abcdef").await;

    let client = UpstreamClient::new(&UpstreamConfig::default(), Some(8));
    let target = TargetAddress::new("http", "127.0.0.1", Some(port), "/");
    let err = client.fetch(&get("/"), &target).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ProxyError>(),
        Some(ProxyError::BodyTooLarge { limit: 8 })
    ));
}

#[tokio::test]
async fn refused_connection_reports_upstream_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = UpstreamClient::new(&UpstreamConfig::default(), None);
    let target = TargetAddress::new("http", "127.0.0.1", Some(port), "/");
    let err = client.fetch(&get("/"), &target).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ProxyError>(),
        Some(ProxyError::UpstreamConnect { .. })
    ));
}

#[tokio::test]
async fn unknown_schemes_are_refused() {
    let client = UpstreamClient::new(&UpstreamConfig::default(), None);
    let target = TargetAddress::new("gopher", "example.com", None, "/");
    let err = client.fetch(&get("/"), &target).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ProxyError>(),
        Some(ProxyError::UnsupportedScheme(scheme)) if scheme == "gopher"
    ));
}
