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

use crate::{
    address::{AddressCodec, ProxyOrigin},
    assets::LandingPage,
    config::YxorpConfig,
    history::ClientHistory,
    proxy::{stages::StagePipeline, Dispatcher, ProxyServer, UpstreamClient},
    rewrite::RewriteEngine,
    telemetry::TelemetrySink,
};

/// Wires configuration into the codec, history, rewrite engine, stage pipeline, upstream
/// client and dispatcher, then hands them to the server.
pub struct YxorpApp {
    server: ProxyServer,
}

impl YxorpApp {
    pub async fn new(config: YxorpConfig) -> Result<Self> {
        let telemetry = TelemetrySink::new(config.telemetry.clone());

        let public_origin = config.public_origin();
        let origin = ProxyOrigin::parse(&public_origin)
            .with_context(|| format!("invalid public origin {public_origin}"))?;
        let codec = Arc::new(AddressCodec::new(origin));

        let history = Arc::new(ClientHistory::new(config.proxy.history_timeout()));
        let engine = RewriteEngine::new(config.proxy.script_heuristics);
        let max_body = config.proxy.max_body_bytes;
        let stages = StagePipeline::build(codec.clone(), engine, max_body);
        tracing::debug!(stages = ?stages.stage_names(), "stage pipeline ready");

        let upstream = Arc::new(UpstreamClient::new(&config.upstream, max_body));
        let landing = LandingPage::load(config.proxy.landing_page.as_deref()).await?;

        let dispatcher = Dispatcher::new(codec, history, stages, upstream, landing.html, telemetry);
        let server = ProxyServer::new(config.listener.clone(), dispatcher, max_body);

        Ok(Self { server })
    }

    pub async fn run(self) -> Result<()> {
        self.server.run().await
    }
}
