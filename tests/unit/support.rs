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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Notify;
use bytes::Bytes;
use http::{header::CONTENT_TYPE, HeaderValue, Method, StatusCode, Uri};
use yxorp::{
    address::{AddressCodec, ProxyOrigin, TargetAddress},
    history::ClientHistory,
    proxy::{
        flow::{RequestParts, ResponseParts},
        stages::StagePipeline,
        Dispatcher, Upstream,
    },
    rewrite::RewriteEngine,
    telemetry::TelemetrySink,
    utils::try_init_test_tracing,
};

pub const PROXY_ORIGIN: &str = "https://proxy.test";
pub const CLIENT: &str = "198.51.100.4";

/// What the fake origin saw.
#[derive(Debug, Clone)]
pub struct Seen {
    pub target: TargetAddress,
    pub request: RequestParts,
}

type Responder = dyn Fn(&TargetAddress) -> Result<ResponseParts> + Send + Sync;

/// Canned upstream: answers from a closure and records every fetch.
pub struct FakeUpstream {
    responder: Box<Responder>,
    pub seen: Mutex<Vec<Seen>>,
}

impl FakeUpstream {
    pub fn new(responder: impl Fn(&TargetAddress) -> Result<ResponseParts> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Every host answers with the same document.
    pub fn serving(content_type: &'static str, body: &'static str) -> Arc<Self> {
        Self::new(move |_| Ok(response(StatusCode::OK, content_type, body)))
    }

    /// Fails for `down`, serves plain text for everything else.
    pub fn failing_for(down: &'static str) -> Arc<Self> {
        Self::new(move |target| {
            if target.hostname == down {
                bail!("connection refused by {down}");
            }
            Ok(response(StatusCode::OK, "text/plain", "ok"))
        })
    }

    pub fn targets(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|s| s.target.url()).collect()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn fetch(&self, request: &RequestParts, target: &TargetAddress) -> Result<ResponseParts> {
        self.seen.lock().unwrap().push(Seen {
            target: target.clone(),
            request: request.clone(),
        });
        (self.responder)(target)
    }
}

/// Origin that accepts the request and never answers. Records when the pending fetch
/// is dropped.
#[derive(Default)]
pub struct StalledUpstream {
    pub started: Notify,
    dropped: Arc<AtomicBool>,
}

impl StalledUpstream {
    pub fn was_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Upstream for StalledUpstream {
    async fn fetch(&self, _request: &RequestParts, _target: &TargetAddress) -> Result<ResponseParts> {
        let _flag = DropFlag(self.dropped.clone());
        self.started.notify_one();
        std::future::pending::<()>().await;
        bail!("stalled origin answered")
    }
}

pub fn response(status: StatusCode, content_type: &'static str, body: &str) -> ResponseParts {
    let mut response = ResponseParts::new(status);
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response.body.push_bytes(body.as_bytes());
    response
}

pub fn get(path: &str) -> RequestParts {
    RequestParts {
        method: Method::GET,
        uri: path.parse::<Uri>().unwrap(),
        ..RequestParts::default()
    }
}

pub fn codec() -> Arc<AddressCodec> {
    Arc::new(AddressCodec::new(ProxyOrigin::parse(PROXY_ORIGIN).unwrap()))
}

pub fn dispatcher(upstream: Arc<FakeUpstream>) -> Dispatcher {
    dispatcher_with(upstream)
}

pub fn dispatcher_with(upstream: Arc<dyn Upstream>) -> Dispatcher {
    try_init_test_tracing();
    let codec = codec();
    let stages = StagePipeline::build(codec.clone(), RewriteEngine::default(), None);
    Dispatcher::new(
        codec,
        Arc::new(ClientHistory::default()),
        stages,
        upstream,
        Bytes::from_static(b"<h1>landing</h1>"),
        TelemetrySink::default(),
    )
}

pub fn body_text(response: &ResponseParts) -> String {
    String::from_utf8_lossy(response.body.as_bytes()).into_owned()
}
