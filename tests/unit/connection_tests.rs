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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use http::{
    header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE},
    Method, StatusCode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use yxorp::proxy::{connection::serve_stream, http1::read_response};

use crate::support::{dispatcher, dispatcher_with, FakeUpstream, StalledUpstream};

fn peer() -> SocketAddr {
    "198.51.100.4:51000".parse().unwrap()
}

#[tokio::test]
async fn keep_alive_connection_serves_requests_in_order() {
    let upstream = FakeUpstream::serving("text/html", r#"<a href="/next">next</a>"#);
    let dispatcher = dispatcher(upstream.clone());

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let session = tokio::spawn(serve_stream(server_read, server_write, peer(), dispatcher, None));

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut client_read = BufReader::new(client_read);

    client_write
        .write_all(b"GET /example.com/ HTTP/1.1\r\nHost: proxy.test\r\n\r\n")
        .await
        .unwrap();
    let first = read_response(&mut client_read, &Method::GET, None).await.unwrap();
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.headers[CONNECTION], "keep-alive");
    assert_eq!(
        first.body.as_bytes(),
        br#"<a href="https://proxy.test/example.com/next">next</a>"#
    );

    client_write
        .write_all(b"GET /next HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let second = read_response(&mut client_read, &Method::GET, None).await.unwrap();
    assert_eq!(second.headers[CONNECTION], "close");

    session.await.unwrap().unwrap();
    assert_eq!(
        upstream.targets(),
        vec!["https://example.com/", "https://example.com/next"]
    );
}

#[tokio::test]
async fn forwarded_for_selects_the_history_key() {
    let upstream = FakeUpstream::serving("text/plain", "ok");
    let dispatcher = dispatcher(upstream);
    let history_view = dispatcher.clone();

    let (client, server) = tokio::io::duplex(16 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let session = tokio::spawn(serve_stream(server_read, server_write, peer(), dispatcher, None));

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut client_read = BufReader::new(client_read);
    client_write
        .write_all(
            b"GET /example.com/ HTTP/1.1\r\nX-Forwarded-For: 203.0.113.50, 10.0.0.2\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    read_response(&mut client_read, &Method::GET, None).await.unwrap();
    session.await.unwrap().unwrap();

    let now = std::time::Instant::now();
    assert!(history_view.history().get("203.0.113.50", now).is_some());
    assert!(history_view.history().get("198.51.100.4", now).is_none());
}

#[tokio::test]
async fn oversized_request_body_gets_413_and_close() {
    let dispatcher = dispatcher(FakeUpstream::serving("text/plain", "ok"));

    let (client, server) = tokio::io::duplex(16 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let session = tokio::spawn(serve_stream(server_read, server_write, peer(), dispatcher, Some(4)));

    let (mut client_read, mut client_write) = tokio::io::split(client);
    client_write
        .write_all(b"POST /example.com/form HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789")
        .await
        .unwrap();

    let mut raw = Vec::new();
    client_read.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();
    assert!(raw.starts_with("HTTP/1.1 413 "), "{raw}");
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_request_line_gets_400() {
    let dispatcher = dispatcher(FakeUpstream::serving("text/plain", "ok"));

    let (client, server) = tokio::io::duplex(16 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let session = tokio::spawn(serve_stream(server_read, server_write, peer(), dispatcher, None));

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut client_read = BufReader::new(client_read);
    client_write.write_all(b"NONSENSE\r\n\r\n").await.unwrap();

    let response = read_response(&mut client_read, &Method::GET, None).await.unwrap();
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.headers[CONTENT_TYPE], "text/plain; charset=utf-8");
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn head_response_sends_no_body_on_keep_alive_connection() {
    let dispatcher = dispatcher(FakeUpstream::serving("text/plain", "ok"));

    let (client, server) = tokio::io::duplex(16 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let session = tokio::spawn(serve_stream(server_read, server_write, peer(), dispatcher, None));

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut client_read = BufReader::new(client_read);
    client_write
        .write_all(
            b"HEAD /favicon.ico HTTP/1.1\r\nHost: proxy.test\r\n\r\nGET / HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_response(&mut client_read, &Method::HEAD, None).await.unwrap();
    assert_eq!(head.status, StatusCode::NOT_FOUND);
    assert_eq!(head.headers[CONTENT_LENGTH], "10");
    assert!(head.body.is_empty());

    let landing = read_response(&mut client_read, &Method::GET, None).await.unwrap();
    assert_eq!(landing.status, StatusCode::OK);
    assert_eq!(landing.body.as_bytes(), b"<h1>landing</h1>");

    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn client_hangup_drops_pending_upstream_fetch() {
    let upstream = Arc::new(StalledUpstream::default());
    let dispatcher = dispatcher_with(upstream.clone());

    let (client, server) = tokio::io::duplex(16 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let session = tokio::spawn(serve_stream(server_read, server_write, peer(), dispatcher, None));

    let (_client_read, mut client_write) = tokio::io::split(client);
    client_write
        .write_all(b"GET /example.com/slow HTTP/1.1\r\nHost: proxy.test\r\n\r\n")
        .await
        .unwrap();
    upstream.started.notified().await;
    assert!(!upstream.was_dropped());

    client_write.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .expect("session ends once the client hangs up")
        .unwrap()
        .unwrap();
    assert!(upstream.was_dropped());
}
