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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use yxorp::{app::YxorpApp, config::YxorpConfig, utils::init_tracing};

/// Command line. Positional arguments override the config file so `yxorp 8080` works
/// without one.
#[derive(Debug, Parser)]
#[command(
    name = "yxorp",
    about = "Content-rewriting reverse proxy that keeps browsing inside one origin"
)]
struct Cli {
    /// Port to listen on.
    port: Option<u16>,

    /// Origin browsers use to reach the proxy, e.g. `https://proxy.example.net`.
    origin: Option<String>,

    /// TOML config file. Built-in defaults are used when it is not given.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTML file served on `/`.
    #[arg(long)]
    landing_page: Option<PathBuf>,

    /// Emit JSON logs instead of human-readable ones.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

impl Cli {
    fn into_config(self) -> Result<YxorpConfig> {
        let mut config = match &self.config {
            Some(path) => YxorpConfig::load(path)?,
            None => YxorpConfig::default(),
        };
        if let Some(port) = self.port {
            config.listener.bind_port = port;
        }
        if let Some(origin) = self.origin {
            config.proxy.public_origin = Some(origin);
        }
        if let Some(landing) = self.landing_page {
            config.proxy.landing_page = Some(landing);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = cli.into_config()?;
    let app = YxorpApp::new(config).await?;

    tokio::select! {
        result = app.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}
