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

use std::time::Instant;

use http::{
    header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION},
    HeaderValue, Method, StatusCode,
};
use yxorp::address::TargetAddress;

use crate::support::{body_text, dispatcher, get, response, FakeUpstream, CLIENT};

#[tokio::test]
async fn html_page_is_fetched_and_rewritten() {
    let upstream = FakeUpstream::serving(
        "text/html; charset=utf-8",
        r#"<a href="/about">about</a><img src="https://cdn.example.net/logo.png" integrity="sha384-abc">"#,
    );
    let dispatcher = dispatcher(upstream.clone());

    let response = dispatcher.dispatch(get("/example.com/dir/page"), CLIENT).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        body_text(&response),
        r#"<a href="https://proxy.test/example.com/about">about</a><img src="https://proxy.test/cdn.example.net/logo.png">"#
    );
    assert_eq!(upstream.targets(), vec!["https://example.com/dir/page"]);

    let seen = upstream.seen.lock().unwrap()[0].clone();
    assert_eq!(seen.request.headers[HOST], "example.com");
    assert_eq!(seen.target.request_target(), "/dir/page");
}

#[tokio::test]
async fn successful_fetch_records_client_history() {
    let upstream = FakeUpstream::serving("text/plain", "ok");
    let dispatcher = dispatcher(upstream);

    dispatcher.dispatch(get("/80/example.com/a"), CLIENT).await;

    let entry = dispatcher.history().get(CLIENT, Instant::now()).unwrap();
    assert_eq!(entry.target, TargetAddress::new("http", "example.com", None, ""));
    assert!(dispatcher.history().get("203.0.113.1", Instant::now()).is_none());
}

#[tokio::test]
async fn relative_paths_are_repaired_from_history() {
    let upstream = FakeUpstream::serving("text/plain", "ok");
    let dispatcher = dispatcher(upstream.clone());

    dispatcher.dispatch(get("/example.com/"), CLIENT).await;
    let response = dispatcher.dispatch(get("/static/app.js?v=2"), CLIENT).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        upstream.targets(),
        vec!["https://example.com/", "https://example.com/static/app.js?v=2"]
    );
}

#[tokio::test]
async fn failed_fetch_retries_against_history_host() {
    let upstream = FakeUpstream::failing_for("cdn.example.net");
    let dispatcher = dispatcher(upstream.clone());

    dispatcher.dispatch(get("/example.com/"), CLIENT).await;
    let response = dispatcher.dispatch(get("/cdn.example.net/lib.js"), CLIENT).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        upstream.targets(),
        vec![
            "https://example.com/",
            "https://cdn.example.net/lib.js",
            "https://example.com/cdn.example.net/lib.js",
        ]
    );
}

#[tokio::test]
async fn failure_without_history_is_a_bad_gateway() {
    let upstream = FakeUpstream::failing_for("cdn.example.net");
    let dispatcher = dispatcher(upstream.clone());

    let response = dispatcher.dispatch(get("/cdn.example.net/lib.js"), CLIENT).await;

    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        body_text(&response),
        "Bad gateway: could not fetch https://cdn.example.net/lib.js\n"
    );
    assert_eq!(upstream.targets().len(), 1);
    assert!(dispatcher.history().is_empty());
}

#[tokio::test]
async fn history_host_failing_again_is_not_retried() {
    let upstream = FakeUpstream::new(|target| {
        if target.path == "/broken" {
            anyhow::bail!("reset by peer");
        }
        Ok(response(StatusCode::OK, "text/plain", "ok"))
    });
    let dispatcher = dispatcher(upstream.clone());

    dispatcher.dispatch(get("/example.com/"), CLIENT).await;
    let response = dispatcher.dispatch(get("/example.com/broken"), CLIENT).await;

    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(upstream.targets().len(), 2);
}

#[tokio::test]
async fn redirects_are_rewritten_to_proxy_urls() {
    let upstream = FakeUpstream::new(|_| {
        let mut redirect = response(StatusCode::FOUND, "text/html", "");
        redirect
            .headers
            .insert(LOCATION, HeaderValue::from_static("https://accounts.example.com/login?next=%2F"));
        redirect
            .headers
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("https://example.com"));
        Ok(redirect)
    });
    let dispatcher = dispatcher(upstream);

    let response = dispatcher.dispatch(get("/example.com/account"), CLIENT).await;

    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(
        response.headers[LOCATION],
        "https://proxy.test/accounts.example.com/login?next=%2F"
    );
    assert!(!response.headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn opaque_bodies_pass_through_untouched() {
    let body = "GIF89a https://example.com/not-a-link";
    let upstream = FakeUpstream::serving("image/gif", body);
    let dispatcher = dispatcher(upstream);

    let response = dispatcher.dispatch(get("/example.com/pixel.gif"), CLIENT).await;

    assert_eq!(body_text(&response), body);
    assert_eq!(response.headers[CONTENT_TYPE], "image/gif");
    assert_eq!(response.headers[CONTENT_LENGTH], body.len().to_string().as_str());
}

#[tokio::test]
async fn local_routes_never_reach_upstream() {
    let upstream = FakeUpstream::serving("text/plain", "ok");
    let dispatcher = dispatcher(upstream.clone());

    let landing = dispatcher.dispatch(get("/"), CLIENT).await;
    assert_eq!(landing.status, StatusCode::OK);
    assert_eq!(body_text(&landing), "<h1>landing</h1>");

    let mut preflight = get("/example.com/api");
    preflight.method = Method::OPTIONS;
    let preflight = dispatcher.dispatch(preflight, CLIENT).await;
    assert_eq!(preflight.headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");

    let bare = dispatcher.dispatch(get("/example.com"), CLIENT).await;
    assert_eq!(bare.status, StatusCode::FOUND);
    assert_eq!(bare.headers[LOCATION], "/example.com/");

    let absolute = dispatcher.dispatch(get("/http://example.com/x"), CLIENT).await;
    assert_eq!(absolute.headers[LOCATION], "/80/example.com/x");

    let favicon = dispatcher.dispatch(get("/favicon.ico"), CLIENT).await;
    assert_eq!(favicon.status, StatusCode::NOT_FOUND);

    assert!(upstream.targets().is_empty());
    assert!(dispatcher.history().is_empty());
}

#[tokio::test]
async fn undecodable_path_retries_against_history_host() {
    let upstream = FakeUpstream::serving("text/plain", "ok");
    let dispatcher = dispatcher(upstream.clone());

    dispatcher.dispatch(get("/example.com/"), CLIENT).await;
    let response = dispatcher.dispatch(get("/99999/x"), CLIENT).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        upstream.targets(),
        vec!["https://example.com/", "https://example.com/99999/x"]
    );
}

#[tokio::test]
async fn undecodable_path_without_history_is_a_bad_gateway() {
    let upstream = FakeUpstream::serving("text/plain", "ok");
    let dispatcher = dispatcher(upstream.clone());

    let response = dispatcher.dispatch(get("/99999/x"), CLIENT).await;

    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(body_text(&response), "Bad gateway: could not fetch /99999/x\n");
    assert!(upstream.targets().is_empty());
}

#[tokio::test]
async fn head_responses_keep_upstream_length() {
    let upstream = FakeUpstream::new(|_| {
        let mut head = response(StatusCode::OK, "text/html", "");
        head.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        Ok(head)
    });
    let dispatcher = dispatcher(upstream);

    let mut request = get("/example.com/index.html");
    request.method = Method::HEAD;
    let response = dispatcher.dispatch(request, CLIENT).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers[CONTENT_LENGTH], "42");
    assert!(response.body.is_empty());
}
