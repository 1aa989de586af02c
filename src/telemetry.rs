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

use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    config::{TelemetryConfig, TelemetryMode},
    proxy::flow::Flow,
};

/// Per-flow event sink. Stdout mode goes through `tracing`; JSON mode prints one object
/// per line for log shippers.
#[derive(Clone, Default)]
pub struct TelemetrySink {
    mode: TelemetryMode,
}

impl TelemetrySink {
    pub fn new(cfg: TelemetryConfig) -> Self {
        Self { mode: cfg.mode }
    }

    pub fn emit(&self, event: &str, flow_id: Uuid, payload: Value) {
        match self.mode {
            TelemetryMode::Stdout => {
                tracing::info!(%flow_id, event, payload = %payload);
            }
            TelemetryMode::Json => {
                let data = json!({
                    "event": event,
                    "flow_id": flow_id,
                    "payload": payload,
                });
                println!("{}", data);
            }
        }
    }

    pub fn flow_completed(&self, flow: &Flow) {
        self.emit("flow_completed", flow.id, flow_payload(flow, None));
    }

    pub fn flow_failed(&self, flow: &Flow, error: &anyhow::Error) {
        self.emit("flow_failed", flow.id, flow_payload(flow, Some(error)));
    }
}

fn flow_payload(flow: &Flow, error: Option<&anyhow::Error>) -> Value {
    let response = flow.response.as_ref();
    json!({
        "source": flow.metadata.source_id,
        "method": flow.request.method.as_str(),
        "path": flow.request.path_and_query(),
        "target": flow.metadata.target.as_ref().map(|target| target.url()),
        "route": flow.metadata.local_route.unwrap_or("proxied"),
        "status": response.map(|r| r.status.as_u16()),
        "content_kind": flow.metadata.content_kind.map(|kind| kind.label()),
        "decoded_from": flow.metadata.decoded_from,
        "upstream_bytes": flow.metadata.upstream_bytes,
        "response_bytes": response.map(|r| r.body.len()),
        "retried": flow.metadata.retried,
        "elapsed_ms": flow.metadata.elapsed_ms().map(|ms| ms as u64),
        "error": error.map(|err| format!("{err:#}")),
    })
}
