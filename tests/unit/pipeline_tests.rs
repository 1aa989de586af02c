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

use std::io::Write;

use flate2::{write::GzEncoder, Compression};
use http::{
    header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_SECURITY_POLICY, HOST, REFERER},
    HeaderValue, StatusCode,
};
use yxorp::{
    address::TargetAddress,
    proxy::{flow::Flow, stages::StagePipeline},
    rewrite::{ContentKind, RewriteEngine},
};

use crate::support::{codec, get, response, CLIENT};

fn pipeline() -> StagePipeline {
    StagePipeline::build(codec(), RewriteEngine::default(), None)
}

fn flow_for(path: &str, target: TargetAddress) -> Flow {
    let mut flow = Flow::new(get(path), CLIENT);
    flow.metadata.target = Some(target);
    flow
}

fn gzip(body: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn stages_run_in_documented_order() {
    assert_eq!(
        pipeline().stage_names(),
        vec!["request-headers", "response-headers", "content-decode", "body-rewrite"]
    );
}

#[tokio::test]
async fn request_headers_are_pointed_at_target() {
    let stages = pipeline();
    let mut flow = flow_for(
        "/example.com/search",
        TargetAddress::new("https", "example.com", None, "/search"),
    );
    let headers = &mut flow.request.headers;
    headers.insert(HOST, HeaderValue::from_static("proxy.test"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
    headers.insert(REFERER, HeaderValue::from_static("https://proxy.test/example.com/home"));

    stages.process_request(&mut flow).await.unwrap();

    let headers = &flow.request.headers;
    assert_eq!(headers[HOST], "example.com");
    assert_eq!(headers[REFERER], "https://example.com/home");
    assert!(!headers.contains_key(ACCEPT_ENCODING));
}

#[tokio::test]
async fn compressed_stylesheet_is_decoded_and_rewritten() {
    let stages = pipeline();
    let mut flow = flow_for(
        "/fonts.example.net/css",
        TargetAddress::new("https", "fonts.example.net", None, "/css"),
    );

    let mut upstream = response(StatusCode::OK, "text/css", "");
    upstream.body.replace(&gzip("@font-face{src:url(/f/roboto.woff2)}"));
    upstream
        .headers
        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    upstream
        .headers
        .insert(CONTENT_SECURITY_POLICY, HeaderValue::from_static("default-src 'self'"));
    flow.response = Some(upstream);

    stages.process_response_headers(&mut flow).await.unwrap();
    stages.process_response_body(&mut flow).await.unwrap();
    stages.finalize_response(&mut flow).await.unwrap();

    let response = flow.response.as_ref().unwrap();
    assert_eq!(
        std::str::from_utf8(response.body.as_bytes()).unwrap(),
        "@font-face{src:url(https://proxy.test/fonts.example.net/f/roboto.woff2)}"
    );
    assert!(!response.headers.contains_key(CONTENT_ENCODING));
    assert!(!response.headers.contains_key(CONTENT_SECURITY_POLICY));
    assert_eq!(flow.metadata.content_kind, Some(ContentKind::Css));
    assert_eq!(flow.metadata.decoded_from.as_deref(), Some("gzip"));
}
