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
use http::header::CONTENT_ENCODING;

use super::FlowStage;
use crate::{
    address::AddressCodec,
    proxy::flow::Flow,
    rewrite::{RewriteContext, RewriteEngine},
};

/// Runs the content pipeline selected by the response's content kind over the buffered
/// body. Bodies that are still encoded after the decode stage are relayed untouched.
pub struct BodyRewriteStage {
    codec: Arc<AddressCodec>,
    engine: RewriteEngine,
}

impl BodyRewriteStage {
    pub fn new(codec: Arc<AddressCodec>, engine: RewriteEngine) -> Self {
        Self { codec, engine }
    }
}

#[async_trait]
impl FlowStage for BodyRewriteStage {
    fn name(&self) -> &'static str {
        "body-rewrite"
    }

    async fn on_response_body(&self, flow: &mut Flow) -> Result<()> {
        let (Some(kind), Some(target)) = (flow.metadata.content_kind, flow.metadata.target.as_ref()) else {
            return Ok(());
        };
        let Some(response) = flow.response.as_mut() else {
            return Ok(());
        };
        flow.metadata.upstream_bytes = response.body.len();

        if !kind.is_rewritable() || response.body.is_empty() || response.headers.contains_key(CONTENT_ENCODING) {
            return Ok(());
        }

        let ctx = RewriteContext::new(&self.codec, target);
        if let Some(rewritten) = self.engine.rewrite(kind, response.body.as_bytes(), &ctx) {
            tracing::debug!(
                flow_id = %flow.id,
                %kind,
                before = response.body.len(),
                after = rewritten.len(),
                "body rewritten"
            );
            response.body.replace(&rewritten);
        }
        Ok(())
    }
}
