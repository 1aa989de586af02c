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

//! Flow stages run around every proxied fetch. Each stage implements [`FlowStage`] and
//! the [`StagePipeline`] drives them in a fixed order: request headers are prepared
//! before the fetch, and on the way back headers are sanitized before the body is
//! decoded and rewritten.

mod decode;
mod request_headers;
mod response_headers;
mod rewrite;

pub use decode::ContentDecodeStage;
pub use request_headers::RequestHeaderStage;
pub use response_headers::ResponseHeaderStage;
pub use rewrite::BodyRewriteStage;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::{address::AddressCodec, proxy::flow::Flow, rewrite::RewriteEngine};

#[derive(Clone)]
/// The ordered stages run for every proxied flow.
pub struct StagePipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    stages: Vec<Arc<dyn FlowStage>>,
}

impl StagePipeline {
    /// Request header rewrite, response header sanitizing, content decoding, then body
    /// rewriting.
    pub fn build(codec: Arc<AddressCodec>, engine: RewriteEngine, max_body: Option<usize>) -> Self {
        let stages: Vec<Arc<dyn FlowStage>> = vec![
            Arc::new(RequestHeaderStage::new(codec.clone())),
            Arc::new(ResponseHeaderStage::new(codec.clone())),
            Arc::new(ContentDecodeStage::new(max_body)),
            Arc::new(BodyRewriteStage::new(codec, engine)),
        ];
        Self::from_stages(stages)
    }

    pub fn from_stages(stages: Vec<Arc<dyn FlowStage>>) -> Self {
        Self {
            inner: Arc::new(PipelineInner { stages }),
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.inner.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn process_request(&self, flow: &mut Flow) -> Result<()> {
        for stage in &self.inner.stages {
            stage.on_request(flow).await?;
        }
        Ok(())
    }

    pub async fn process_response_headers(&self, flow: &mut Flow) -> Result<()> {
        for stage in &self.inner.stages {
            stage.on_response_headers(flow).await?;
        }
        Ok(())
    }

    pub async fn process_response_body(&self, flow: &mut Flow) -> Result<()> {
        for stage in &self.inner.stages {
            stage.on_response_body(flow).await?;
        }
        Ok(())
    }

    pub async fn finalize_response(&self, flow: &mut Flow) -> Result<()> {
        for stage in &self.inner.stages {
            stage.on_response_finalized(flow).await?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait FlowStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, _flow: &mut Flow) -> Result<()> {
        Ok(())
    }

    async fn on_response_headers(&self, _flow: &mut Flow) -> Result<()> {
        Ok(())
    }

    async fn on_response_body(&self, _flow: &mut Flow) -> Result<()> {
        Ok(())
    }

    async fn on_response_finalized(&self, _flow: &mut Flow) -> Result<()> {
        Ok(())
    }
}
