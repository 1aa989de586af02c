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

use std::{sync::Arc, time::Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{
    header::{
        ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
        ACCESS_CONTROL_MAX_AGE, CONTENT_LENGTH, CONTENT_TYPE, LOCATION,
    },
    HeaderValue, Method, StatusCode,
};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{
    client::Upstream,
    flow::{Flow, RequestParts, ResponseParts},
    http1::enforce_content_length,
    stages::StagePipeline,
};
use crate::{
    address::{
        codec::{is_plausible_host, leading_slash},
        AddressCodec, TargetAddress,
    },
    history::ClientHistory,
    telemetry::TelemetrySink,
};

static SCHEME_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z][a-zA-Z0-9+.-]*):/+").expect("scheme prefix pattern compiles")
});

/// Dotted single-segment paths ending in one of these are treated as root-relative files
/// rather than hostnames.
const FILE_EXTENSIONS: &[&str] = &[
    "js", "mjs", "css", "map", "json", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "avif",
    "woff", "woff2", "ttf", "otf", "html", "htm", "txt", "xml", "php", "aspx",
];

/// What a request path asks of the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// CORS preflight answered locally.
    Preflight,
    /// `/`: the landing page.
    Landing,
    /// `/favicon.ico` belongs to the proxy, not to a target.
    Favicon,
    /// `/example.com` gets a trailing slash so relative links resolve under it.
    BareDomain { location: String },
    /// `/https://example.com/a` typed or pasted into the address bar.
    AbsoluteUrl { location: String },
    /// Everything else is an encoded target.
    Proxied,
}

impl Route {
    pub fn classify(method: &Method, path_and_query: &str, codec: &AddressCodec) -> Route {
        if method == Method::OPTIONS {
            return Route::Preflight;
        }

        let (path, query) = match path_and_query.find('?') {
            Some(idx) => path_and_query.split_at(idx),
            None => (path_and_query, ""),
        };

        if path == "/" || path.is_empty() {
            return Route::Landing;
        }
        if path == "/favicon.ico" {
            return Route::Favicon;
        }

        let rest = &path[1..];
        if let Some(caps) = SCHEME_PREFIX.captures(rest) {
            let normalized = format!("{}://{}{}", &caps[1], &rest[caps[0].len()..], query);
            if let Some(target) = codec.parse_absolute(&normalized) {
                return Route::AbsoluteUrl {
                    location: codec.encode(&target),
                };
            }
        }

        if !rest.contains('/') && looks_like_domain(rest) {
            return Route::BareDomain {
                location: format!("/{rest}/{query}"),
            };
        }

        Route::Proxied
    }

    fn label(&self) -> &'static str {
        match self {
            Route::Preflight => "preflight",
            Route::Landing => "landing",
            Route::Favicon => "favicon",
            Route::BareDomain { .. } => "bare-domain",
            Route::AbsoluteUrl { .. } => "absolute-url",
            Route::Proxied => "proxied",
        }
    }
}

fn looks_like_domain(segment: &str) -> bool {
    let host = segment.rsplit_once(':').map_or(segment, |(host, _)| host);
    if !host.contains('.') || !is_plausible_host(host) {
        return false;
    }
    let last_label = host.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    !FILE_EXTENSIONS.contains(&last_label.as_str())
}

/// Routes client requests: local answers for the landing page, redirects and preflights,
/// and proxied fetches through the stage pipeline with a single history-based retry.
#[derive(Clone)]
pub struct Dispatcher {
    codec: Arc<AddressCodec>,
    history: Arc<ClientHistory>,
    stages: StagePipeline,
    upstream: Arc<dyn Upstream>,
    landing_page: Bytes,
    telemetry: TelemetrySink,
}

impl Dispatcher {
    pub fn new(
        codec: Arc<AddressCodec>,
        history: Arc<ClientHistory>,
        stages: StagePipeline,
        upstream: Arc<dyn Upstream>,
        landing_page: Bytes,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            codec,
            history,
            stages,
            upstream,
            landing_page,
            telemetry,
        }
    }

    pub fn codec(&self) -> &AddressCodec {
        &self.codec
    }

    pub fn history(&self) -> &ClientHistory {
        &self.history
    }

    /// Answers one request. Failures never escape: they become a 502 naming the URL.
    pub async fn dispatch(&self, request: RequestParts, source_id: &str) -> ResponseParts {
        let route = Route::classify(&request.method, request.path_and_query(), &self.codec);
        tracing::debug!(
            source = source_id,
            method = %request.method,
            path = request.path_and_query(),
            route = route.label(),
            "routing request"
        );

        let local = match &route {
            Route::Preflight => Some(preflight()),
            Route::Landing => Some(self.landing()),
            Route::Favicon => Some(text_response(StatusCode::NOT_FOUND, "not found\n")),
            Route::BareDomain { location } | Route::AbsoluteUrl { location } => Some(redirect(location)),
            Route::Proxied => None,
        };

        if let Some(response) = local {
            let mut flow = Flow::new(request, source_id);
            flow.metadata.local_route = Some(route.label());
            flow.response = Some(response.clone());
            self.telemetry.flow_completed(&flow);
            return response;
        }

        self.proxy(request, source_id).await
    }

    async fn proxy(&self, request: RequestParts, source_id: &str) -> ResponseParts {
        let path = request.path_and_query().to_string();
        let last = self
            .history
            .get(source_id, Instant::now())
            .map(|entry| entry.target);

        let (attempted, error) = match self.codec.resolve(&path, last.as_ref()) {
            Ok(target) => match self.forward(&request, source_id, &target).await {
                Ok(flow) => return self.complete(flow),
                Err(err) => (Some(target), err),
            },
            Err(err) => (None, anyhow::Error::new(err).context(format!("cannot decode {path}"))),
        };

        // Retry only when history knows a different host than the one that just failed.
        let fallback = last.filter(|last| {
            attempted
                .as_ref()
                .map_or(true, |tried| !tried.hostname.eq_ignore_ascii_case(&last.hostname))
        });
        let Some(fallback) = fallback else {
            return self.bad_gateway(request, source_id, attempted, error);
        };

        tracing::warn!(
            source = source_id,
            failed = %attempted.as_ref().map(|t| t.url()).unwrap_or_else(|| path.clone()),
            fallback_host = %fallback.hostname,
            error = %format!("{error:#}"),
            "upstream attempt failed, retrying against client history"
        );

        let retry_target = fallback.with_path(leading_slash(&path));
        match self.forward(&request, source_id, &retry_target).await {
            Ok(mut flow) => {
                flow.metadata.retried = true;
                self.complete(flow)
            }
            Err(err) => self.bad_gateway(request, source_id, Some(retry_target), err),
        }
    }

    /// Runs one upstream attempt through the stages.
    async fn forward(&self, request: &RequestParts, source_id: &str, target: &TargetAddress) -> Result<Flow> {
        let mut flow = Flow::new(request.clone(), source_id);
        flow.metadata.target = Some(target.clone());
        self.run_stages(&mut flow, target).await?;
        Ok(flow)
    }

    async fn run_stages(&self, flow: &mut Flow, target: &TargetAddress) -> Result<()> {
        self.stages.process_request(flow).await?;

        tracing::debug!(flow_id = %flow.id, target = %target, "fetching upstream");
        let response = self
            .upstream
            .fetch(&flow.request, target)
            .await
            .with_context(|| format!("fetch {target}"))?;
        tracing::debug!(flow_id = %flow.id, status = %response.status, "upstream responded");
        // A HEAD answer has no body to measure; its length describes the GET representation.
        let is_head = flow.request.method == Method::HEAD;
        let head_length = if is_head {
            response.headers.get(CONTENT_LENGTH).cloned()
        } else {
            None
        };
        flow.response = Some(response);

        self.stages.process_response_headers(flow).await?;
        self.stages.process_response_body(flow).await?;
        self.stages.finalize_response(flow).await?;

        let response = flow
            .response
            .as_mut()
            .context("response missing after pipeline execution")?;
        if !is_head {
            enforce_content_length(response)?;
        } else if let Some(length) = head_length {
            response.headers.insert(CONTENT_LENGTH, length);
        }
        Ok(())
    }

    fn complete(&self, mut flow: Flow) -> ResponseParts {
        if let Some(target) = flow.metadata.target.as_ref() {
            self.history.touch(&flow.metadata.source_id, target, Instant::now());
        }
        self.telemetry.flow_completed(&flow);
        flow.response
            .take()
            .unwrap_or_else(|| text_response(StatusCode::BAD_GATEWAY, "empty upstream response\n"))
    }

    fn bad_gateway(
        &self,
        request: RequestParts,
        source_id: &str,
        target: Option<TargetAddress>,
        err: anyhow::Error,
    ) -> ResponseParts {
        let url = target
            .as_ref()
            .map(|t| t.url())
            .unwrap_or_else(|| request.path_and_query().to_string());
        tracing::warn!(source = source_id, %url, error = %format!("{err:#}"), "upstream fetch failed");

        let response = text_response(StatusCode::BAD_GATEWAY, &format!("Bad gateway: could not fetch {url}\n"));
        let mut flow = Flow::new(request, source_id);
        flow.metadata.target = target;
        flow.response = Some(response.clone());
        self.telemetry.flow_failed(&flow, &err);
        response
    }

    fn landing(&self) -> ResponseParts {
        let mut response = ResponseParts::new(StatusCode::OK);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        response.body.push_bytes(&self.landing_page);
        finish(response)
    }
}

fn preflight() -> ResponseParts {
    let mut response = ResponseParts::new(StatusCode::OK);
    let headers = &mut response.headers;
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    finish(response)
}

fn redirect(location: &str) -> ResponseParts {
    let mut response = ResponseParts::new(StatusCode::FOUND);
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers.insert(LOCATION, value);
            finish(response)
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "invalid redirect target\n"),
    }
}

fn text_response(status: StatusCode, body: &str) -> ResponseParts {
    let mut response = ResponseParts::new(status);
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response.body.push_bytes(body.as_bytes());
    finish(response)
}

fn finish(mut response: ResponseParts) -> ResponseParts {
    if let Err(err) = enforce_content_length(&mut response) {
        tracing::warn!(error = %err, "failed to set content-length on local response");
    }
    response
}
