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

use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::{lookup_host, TcpStream},
    task,
    time::{sleep, timeout},
};
use tokio_rustls::TlsConnector;

use super::{
    flow::{RequestParts, ResponseParts},
    http1,
};
use crate::{address::TargetAddress, config::UpstreamConfig, utils::ProxyError};

/// Anything that can answer a prepared request for a target. The dispatcher only talks
/// to this trait so tests can swap in canned origins.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: &RequestParts, target: &TargetAddress) -> Result<ResponseParts>;
}

const DNS_CACHE_TTL_SECS: u64 = 60;
const DNS_MAX_ATTEMPTS: usize = 3;
const DNS_RETRY_BACKOFF_MS: u64 = 50;

static DNS_CACHE: Lazy<DashMap<String, CachedDnsEntry>> = Lazy::new(DashMap::new);

#[derive(Clone)]
struct CachedDnsEntry {
    expires_at: Instant,
    addrs: Vec<SocketAddr>,
}

/// Dials origins over plain TCP (`http`, `ws`) or TLS (`https`, `wss`) and performs a
/// single HTTP/1.1 exchange per connection.
#[derive(Clone)]
pub struct UpstreamClient {
    connector: TlsConnector,
    connect_timeout: Duration,
    tls_handshake_timeout: Duration,
    response_timeout: Duration,
    max_body: Option<usize>,
}

impl UpstreamClient {
    pub fn new(cfg: &UpstreamConfig, max_body: Option<usize>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            connector: TlsConnector::from(Arc::new(tls)),
            connect_timeout: cfg.connect_timeout(),
            tls_handshake_timeout: cfg.tls_handshake_timeout(),
            response_timeout: cfg.response_timeout(),
            max_body,
        }
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addr_label = format!("{host}:{port}");
        tracing::debug!(%addr_label, "dialing upstream");

        let addrs = resolve_upstream_addrs(host, port)
            .await
            .with_context(|| format!("failed to resolve {addr_label}"))?;

        let mut last_err: Option<anyhow::Error> = None;
        for addr in addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    tracing::debug!(%addr, "upstream TCP connected");
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(err)) => {
                    tracing::debug!(%addr, error = %err, "upstream TCP connect failed");
                    last_err = Some(err.into());
                }
                Err(_) => {
                    tracing::warn!(%addr, "upstream TCP connect timed out after {:?}", self.connect_timeout);
                    last_err = Some(anyhow!(
                        "TCP connect to {addr} timed out after {:?}",
                        self.connect_timeout
                    ));
                }
            }
        }

        let reason = last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| "resolver returned no addresses".to_string());
        Err(ProxyError::UpstreamConnect {
            host: addr_label,
            reason,
        }
        .into())
    }

    async fn exchange<S>(&self, stream: S, request: &RequestParts, target: &TargetAddress) -> Result<ResponseParts>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        let work = async {
            http1::write_request(&mut stream, request, &target.request_target())
                .await
                .context("failed to send request upstream")?;
            http1::read_response(&mut stream, &request.method, self.max_body)
                .await
                .context("failed to read upstream response")
        };

        match timeout(self.response_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "upstream {} did not answer within {:?}",
                target.authority(),
                self.response_timeout
            )),
        }
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn fetch(&self, request: &RequestParts, target: &TargetAddress) -> Result<ResponseParts> {
        let port = target
            .effective_port()
            .ok_or_else(|| ProxyError::UnsupportedScheme(target.scheme.clone()))?;

        match target.scheme.as_str() {
            "http" | "ws" => {
                let stream = self.connect_tcp(&target.hostname, port).await?;
                self.exchange(stream, request, target).await
            }
            "https" | "wss" => {
                let stream = self.connect_tcp(&target.hostname, port).await?;
                let server_name = ServerName::try_from(target.hostname.clone())
                    .with_context(|| format!("invalid hostname: {}", target.hostname))?;
                let tls_stream = match timeout(
                    self.tls_handshake_timeout,
                    self.connector.connect(server_name, stream),
                )
                .await
                {
                    Ok(result) => result.map_err(|err| ProxyError::UpstreamConnect {
                        host: target.authority(),
                        reason: format!("TLS handshake failed: {err}"),
                    })?,
                    Err(_) => {
                        return Err(anyhow!(
                            "TLS handshake with {} timed out after {:?}",
                            target.authority(),
                            self.tls_handshake_timeout
                        ))
                    }
                };
                tracing::debug!(host = %target.hostname, port, "upstream TLS handshake complete");
                self.exchange(tls_stream, request, target).await
            }
            other => Err(ProxyError::UnsupportedScheme(other.to_string()).into()),
        }
    }
}

async fn resolve_upstream_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let key = format!("{host}:{port}");
    let now = Instant::now();

    if let Some(entry) = DNS_CACHE.get(&key) {
        if entry.expires_at > now && !entry.addrs.is_empty() {
            tracing::trace!(target: "dns", %host, port, "dns cache hit");
            return Ok(entry.addrs.clone());
        }
    }
    DNS_CACHE.remove_if(&key, |_, entry| entry.expires_at <= now);

    let addrs = resolve_with_backoff(host, port).await?;
    if !addrs.is_empty() {
        DNS_CACHE.insert(
            key,
            CachedDnsEntry {
                expires_at: Instant::now() + Duration::from_secs(DNS_CACHE_TTL_SECS),
                addrs: addrs.clone(),
            },
        );
    }

    Ok(addrs)
}

async fn resolve_with_backoff(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    // IPv6 literals arrive bracketed from the URL parser.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=DNS_MAX_ATTEMPTS {
        match lookup_host((host, port)).await {
            Ok(iter) => {
                let addrs: Vec<SocketAddr> = iter.collect();
                if !addrs.is_empty() {
                    tracing::trace!(target: "dns", %host, port, attempt, "tokio resolver success");
                    return Ok(addrs);
                }
                last_err = Some(anyhow!("resolver returned no addresses for {host}:{port}"));
            }
            Err(err) => {
                tracing::debug!(target: "dns", %host, port, attempt, error = %err, "tokio resolver error");
                last_err = Some(err.into());
            }
        }

        if attempt < DNS_MAX_ATTEMPTS {
            sleep(Duration::from_millis(DNS_RETRY_BACKOFF_MS * attempt as u64)).await;
        }
    }

    tracing::warn!(target: "dns", %host, port, "tokio resolver exhausted retries; falling back to system resolver");
    match resolve_with_system(host, port).await {
        Ok(addrs) => Ok(addrs),
        Err(fallback_err) => Err(last_err.unwrap_or(fallback_err)),
    }
}

async fn resolve_with_system(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let host_owned = host.to_string();
    task::spawn_blocking(move || {
        (&host_owned[..], port)
            .to_socket_addrs()
            .map(|iter| iter.collect::<Vec<_>>())
            .map_err(|err| anyhow!(err))
    })
    .await
    .context("system resolver task failed")?
}
