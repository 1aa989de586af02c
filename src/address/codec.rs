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

use std::{fmt, net::IpAddr};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use url::Url;

use super::ports::ProtocolTable;
use crate::utils::{ProxyError, ProxyResult};

static ABSOLUTE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").expect("absolute url pattern compiles")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("encoded path has no hostname: {0:?}")]
    MissingHost(String),

    #[error("invalid port segment: {0:?}")]
    InvalidPort(String),
}

/// The proxy's own public origin. Every encoded path is relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOrigin {
    scheme: String,
    hostname: String,
    port: u16,
    authority: String,
}

impl ProxyOrigin {
    /// Parses `http://localhost:5050` style origins. Paths and trailing slashes are ignored.
    pub fn parse(raw: &str) -> ProxyResult<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|err| ProxyError::InvalidOrigin(format!("{raw}: {err}")))?;
        let hostname = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ProxyError::InvalidOrigin(format!("{raw}: missing host")))?
            .to_ascii_lowercase();
        let scheme = url.scheme().to_ascii_lowercase();
        let port = url
            .port_or_known_default()
            .or_else(|| ProtocolTable::standard().port_for(&scheme))
            .ok_or_else(|| ProxyError::InvalidOrigin(format!("{raw}: cannot infer port")))?;
        let authority = match url.port() {
            Some(explicit) => format!("{hostname}:{explicit}"),
            None => hostname.clone(),
        };

        Ok(Self {
            scheme,
            hostname,
            port,
            authority,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// `scheme://authority` without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.authority)
    }
}

/// A site the proxy fetches on behalf of the browser.
///
/// `port` is only set when it differs from the scheme's canonical port, and `path`
/// carries the query and fragment verbatim (it may be empty for bare-origin references).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    pub scheme: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub path: String,
}

impl TargetAddress {
    pub fn new(
        scheme: impl Into<String>,
        hostname: impl Into<String>,
        port: Option<u16>,
        path: impl Into<String>,
    ) -> Self {
        let scheme = scheme.into().trim_end_matches(':').to_ascii_lowercase();
        let canonical = ProtocolTable::standard().port_for(&scheme);
        Self {
            port: port.filter(|p| Some(*p) != canonical),
            scheme,
            hostname: hostname.into().to_ascii_lowercase(),
            path: path.into(),
        }
    }

    /// Builds an address from a parsed URL. `literal` is the text the URL came from and
    /// only matters for the bare-origin case: `https://example.com` stays slash-less.
    pub fn from_url(url: &Url, literal: &str) -> Option<Self> {
        let scheme = url.scheme().to_ascii_lowercase();
        if !ProtocolTable::standard().knows(&scheme) {
            return None;
        }
        let hostname = url.host_str().filter(|host| !host.is_empty())?;

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        if let Some(fragment) = url.fragment() {
            path.push('#');
            path.push_str(fragment);
        }
        if path == "/" && !literal.ends_with('/') {
            path.clear();
        }

        Some(Self::new(scheme, hostname, url.port(), path))
    }

    /// Port used on the wire: the explicit one or the scheme's canonical port.
    pub fn effective_port(&self) -> Option<u16> {
        self.port
            .or_else(|| ProtocolTable::standard().port_for(&self.scheme))
    }

    /// `host[:port]`, suitable for the upstream `Host` header.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => self.hostname.clone(),
        }
    }

    /// Same scheme/host/port with an empty path.
    pub fn origin(&self) -> TargetAddress {
        self.with_path("")
    }

    pub fn with_path(&self, path: impl Into<String>) -> TargetAddress {
        TargetAddress {
            scheme: self.scheme.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            path: path.into(),
        }
    }

    /// Origin-form request target for the upstream request line (fragment dropped).
    pub fn request_target(&self) -> String {
        let without_fragment = self.path.split('#').next().unwrap_or_default();
        if without_fragment.starts_with('/') {
            without_fragment.to_string()
        } else {
            format!("/{without_fragment}")
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority(), self.path)
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Encodes targets into paths under the proxy origin and back.
#[derive(Debug, Clone)]
pub struct AddressCodec {
    origin: ProxyOrigin,
    table: &'static ProtocolTable,
}

impl AddressCodec {
    pub fn new(origin: ProxyOrigin) -> Self {
        Self {
            origin,
            table: ProtocolTable::standard(),
        }
    }

    pub fn origin(&self) -> &ProxyOrigin {
        &self.origin
    }

    /// Substring match on the proxy hostname; anything that matches is already proxied.
    pub fn points_at_proxy(&self, hostname: &str) -> bool {
        hostname
            .to_ascii_lowercase()
            .contains(self.origin.hostname())
    }

    /// `/[<port>/]<hostname><path>`.
    pub fn encode(&self, target: &TargetAddress) -> String {
        if self.points_at_proxy(&target.hostname) {
            return if target.path.starts_with('/') {
                target.path.clone()
            } else {
                format!("/{}", target.path)
            };
        }

        let mut encoded = String::with_capacity(target.hostname.len() + target.path.len() + 8);
        if let Some(port) = self.port_segment(target) {
            encoded.push('/');
            encoded.push_str(&port.to_string());
        }
        encoded.push('/');
        encoded.push_str(&target.hostname);
        if !target.path.is_empty() && !target.path.starts_with(&['/', '?', '#'][..]) {
            encoded.push('/');
        }
        encoded.push_str(&target.path);
        encoded
    }

    /// The port is written whenever decode could not infer it: a non-canonical port, or a
    /// scheme other than the proxy's own (the port is then the only scheme signal).
    fn port_segment(&self, target: &TargetAddress) -> Option<u16> {
        let canonical = self.table.port_for(&target.scheme);
        let effective = target.port.or(canonical)?;
        let foreign_scheme = !target.scheme.eq_ignore_ascii_case(self.origin.scheme());
        (Some(effective) != canonical || foreign_scheme).then_some(effective)
    }

    /// Reverses [`AddressCodec::encode`]. `fallback_scheme` is used when no port segment
    /// is present or the port maps to no known scheme.
    pub fn decode(&self, encoded: &str, fallback_scheme: &str) -> Result<TargetAddress, DecodeError> {
        let rest = encoded.trim_start_matches('/');
        let (segment_port, rest) = split_port_segment(rest)?;

        let host_end = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
        let (host_segment, path) = rest.split_at(host_end);
        if host_segment.is_empty() {
            return Err(DecodeError::MissingHost(encoded.to_string()));
        }
        let (hostname, typed_port) = split_host_port(host_segment)?;

        let port = segment_port.or(typed_port);
        let scheme = port
            .and_then(|p| self.table.scheme_for(p))
            .unwrap_or(fallback_scheme);

        Ok(TargetAddress::new(scheme, hostname, port, path))
    }

    /// Decodes an incoming request path, repairing it with the client's last known target
    /// when the first segment is not a hostname (e.g. `/static/app.js` requested by a page
    /// that built a root-relative URL in script).
    pub fn resolve(
        &self,
        request_path: &str,
        last_target: Option<&TargetAddress>,
    ) -> Result<TargetAddress, DecodeError> {
        let decoded = self.decode(request_path, self.origin.scheme())?;
        if is_plausible_host(&decoded.hostname) {
            return Ok(decoded);
        }
        match last_target {
            Some(last) => {
                tracing::debug!(
                    path = request_path,
                    last_host = %last.hostname,
                    "reconciling relative request against client history"
                );
                Ok(last.with_path(leading_slash(request_path)))
            }
            None => Ok(decoded),
        }
    }

    /// Parses `scheme://...` into a target, ignoring unknown schemes and the proxy itself.
    pub fn parse_absolute(&self, literal: &str) -> Option<TargetAddress> {
        self.parse_absolute_with_literal(literal, literal)
    }

    /// Rewrites one URL literal found in a document served from `page`.
    ///
    /// Absolute and protocol-relative URLs are encoded, root-relative ones are anchored on
    /// the page's origin, and purely relative ones are returned as-is since they already
    /// resolve under the rewritten base.
    pub fn rewrite_url(&self, literal: &str, page: &TargetAddress) -> String {
        let trimmed = literal.trim();
        let candidate = if ABSOLUTE_URL.is_match(trimmed) {
            trimmed.to_string()
        } else if let Some(rest) = trimmed.strip_prefix("//") {
            format!("{}://{}", page.scheme, rest)
        } else if trimmed.starts_with('/') {
            format!("{}{}", page.origin().url(), trimmed)
        } else {
            return literal.to_string();
        };

        match self.parse_absolute_with_literal(&candidate, trimmed) {
            Some(target) => format!("{}{}", self.origin.base_url(), self.encode(&target)),
            None => literal.to_string(),
        }
    }

    fn parse_absolute_with_literal(&self, candidate: &str, literal: &str) -> Option<TargetAddress> {
        let url = Url::parse(candidate).ok()?;
        if url.host_str().is_some_and(|host| self.points_at_proxy(host)) {
            return None;
        }
        TargetAddress::from_url(&url, literal)
    }

    /// Maps a URL under the proxy origin back to the target URL it encodes.
    pub fn unproxy(&self, raw: &str) -> Option<String> {
        let url = Url::parse(raw).ok()?;
        if !url.host_str()?.eq_ignore_ascii_case(self.origin.hostname()) {
            return None;
        }
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        self.decode(&path, self.origin.scheme())
            .ok()
            .filter(|target| is_plausible_host(&target.hostname))
            .map(|target| target.url())
    }
}

fn split_port_segment(rest: &str) -> Result<(Option<u16>, &str), DecodeError> {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || rest.as_bytes().get(digits) != Some(&b'/') {
        return Ok((None, rest));
    }
    let port = parse_port(&rest[..digits])?;
    Ok((Some(port), &rest[digits + 1..]))
}

fn split_host_port(segment: &str) -> Result<(&str, Option<u16>), DecodeError> {
    let colon = if segment.starts_with('[') {
        segment
            .find(']')
            .and_then(|end| segment[end..].find(':').map(|offset| end + offset))
    } else {
        segment.rfind(':')
    };

    match colon {
        Some(idx) => Ok((&segment[..idx], Some(parse_port(&segment[idx + 1..])?))),
        None => Ok((segment, None)),
    }
}

fn parse_port(raw: &str) -> Result<u16, DecodeError> {
    raw.parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| DecodeError::InvalidPort(raw.to_string()))
}

pub(crate) fn is_plausible_host(hostname: &str) -> bool {
    hostname.contains('.')
        || hostname.eq_ignore_ascii_case("localhost")
        || hostname
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok()
}

pub(crate) fn leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
