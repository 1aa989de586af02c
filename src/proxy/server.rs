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

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::config::ListenerConfig;

use super::{connection::handle_connection, dispatch::Dispatcher};

/// Owns the listening socket and spawns one task per accepted client. Connections share
/// the dispatcher, so history and the DNS cache are common to all of them.
pub struct ProxyServer {
    listener_cfg: ListenerConfig,
    dispatcher: Dispatcher,
    max_body: Option<usize>,
}

impl ProxyServer {
    pub fn new(listener_cfg: ListenerConfig, dispatcher: Dispatcher, max_body: Option<usize>) -> Self {
        Self {
            listener_cfg,
            dispatcher,
            max_body,
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .listener_cfg
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address {}", self.listener_cfg.bind_address))?;
        Ok(SocketAddr::new(ip, self.listener_cfg.bind_port))
    }

    /// Binds the configured address and serves until the accept loop fails.
    pub async fn run(self) -> Result<()> {
        let addr = self.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            origin = %self.dispatcher.codec().origin().base_url(),
            "yxorp listener online"
        );

        loop {
            let (socket, peer) = listener.accept().await?;
            let dispatcher = self.dispatcher.clone();
            let max_body = self.max_body;

            tracing::debug!(%peer, "accepted client");
            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, peer, dispatcher, max_body).await {
                    tracing::warn!(%peer, "client session ended with error: {err:#}");
                }
            });
        }
    }
}
