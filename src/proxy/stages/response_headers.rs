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

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use http::{
    header::{
        ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_SECURITY_POLICY,
        CONTENT_SECURITY_POLICY_REPORT_ONLY, LOCATION, TRANSFER_ENCODING,
    },
    HeaderValue,
};

use super::FlowStage;
use crate::{
    address::AddressCodec,
    proxy::{flow::Flow, http1::strip_hop_by_hop},
    rewrite::ContentKind,
};

/// Sanitizes upstream response headers before the body stages run.
///
/// Framing headers are dropped (the body is re-framed once rewriting is done), as are
/// the CORS and CSP headers that would pin the page to its real origin. A `Location`
/// redirect is rewritten so the browser follows it through the proxy.
pub struct ResponseHeaderStage {
    codec: Arc<AddressCodec>,
}

impl ResponseHeaderStage {
    pub fn new(codec: Arc<AddressCodec>) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl FlowStage for ResponseHeaderStage {
    fn name(&self) -> &'static str {
        "response-headers"
    }

    async fn on_response_headers(&self, flow: &mut Flow) -> Result<()> {
        let Some(response) = flow.response.as_mut() else {
            return Ok(());
        };
        let headers = &mut response.headers;

        strip_hop_by_hop(headers);
        for name in [
            ACCESS_CONTROL_ALLOW_ORIGIN,
            CONTENT_SECURITY_POLICY,
            CONTENT_SECURITY_POLICY_REPORT_ONLY,
            CONTENT_LENGTH,
            TRANSFER_ENCODING,
        ] {
            headers.remove(name);
        }

        if let Some(target) = flow.metadata.target.as_ref() {
            let rewritten = headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(|location| (location.to_string(), self.codec.rewrite_url(location, target)))
                .filter(|(before, after)| before != after);
            if let Some((before, after)) = rewritten {
                if let Ok(value) = HeaderValue::from_str(&after) {
                    tracing::debug!(flow_id = %flow.id, from = %before, to = %after, "rewrote redirect location");
                    headers.insert(LOCATION, value);
                }
            }
        }

        flow.metadata.content_kind = Some(ContentKind::from_headers(headers));
        Ok(())
    }
}
