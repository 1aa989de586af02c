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

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::{
    header::{ACCEPT_ENCODING, CONNECTION, HOST, ORIGIN, REFERER},
    HeaderValue,
};

use super::FlowStage;
use crate::{
    address::AddressCodec,
    proxy::{flow::Flow, http1::strip_hop_by_hop},
};

/// Headers that would leak the proxy hop or the browser's view of the proxy origin.
const STRIPPED_PREFIXES: &[&str] = &["sec-fetch-", "x-forwarded-"];
const STRIPPED_HEADERS: &[&str] = &["forwarded", "via", "x-real-ip"];

/// Points the client's request at the target: `Host` becomes the target authority,
/// proxy-side headers are removed, and `Referer`/`Origin` are mapped back from proxy
/// URLs to the target URLs they encode.
pub struct RequestHeaderStage {
    codec: Arc<AddressCodec>,
}

impl RequestHeaderStage {
    pub fn new(codec: Arc<AddressCodec>) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl FlowStage for RequestHeaderStage {
    fn name(&self) -> &'static str {
        "request-headers"
    }

    async fn on_request(&self, flow: &mut Flow) -> Result<()> {
        let target = flow
            .metadata
            .target
            .clone()
            .context("request stage ran before the target was resolved")?;
        let headers = &mut flow.request.headers;

        strip_hop_by_hop(headers);
        headers.remove(ACCEPT_ENCODING);
        for name in STRIPPED_HEADERS {
            headers.remove(*name);
        }
        let prefixed: Vec<_> = headers
            .keys()
            .filter(|name| STRIPPED_PREFIXES.iter().any(|prefix| name.as_str().starts_with(prefix)))
            .cloned()
            .collect();
        for name in prefixed {
            headers.remove(name);
        }

        headers.insert(
            HOST,
            HeaderValue::from_str(&target.authority()).context("target authority is not a valid header")?,
        );

        let referer = headers
            .get(REFERER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| self.codec.unproxy(value))
            .and_then(|url| HeaderValue::from_str(&url).ok());
        match referer {
            Some(value) => {
                headers.insert(REFERER, value);
            }
            None => {
                headers.remove(REFERER);
            }
        }

        if headers.contains_key(ORIGIN) {
            let origin = target.origin().url();
            headers.insert(
                ORIGIN,
                HeaderValue::from_str(&origin).context("target origin is not a valid header")?,
            );
        }

        // One exchange per upstream connection.
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        tracing::trace!(flow_id = %flow.id, target = %target, "request headers rewritten");
        Ok(())
    }
}
