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

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use uuid::Uuid;

use crate::{address::TargetAddress, rewrite::ContentKind};

/// Everything known about one client request while it is routed, forwarded upstream
/// and rewritten. A flow is owned by the connection task that parsed the request, so
/// stages mutate it through `&mut` without locking.
#[derive(Debug)]
pub struct Flow {
    /// UUID v7, so log lines sort by creation time.
    pub id: Uuid,

    pub request: RequestParts,

    /// `None` until upstream answered, or when the dispatcher answered locally.
    pub response: Option<ResponseParts>,

    pub metadata: FlowMetadata,
}

impl Flow {
    pub fn new(request: RequestParts, source_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            request,
            response: None,
            metadata: FlowMetadata {
                source_id: source_id.into(),
                started_at: Some(Instant::now()),
                ..FlowMetadata::default()
            },
        }
    }
}

/// Owned request as read off the client socket. `Clone` so a failed upstream attempt can
/// be replayed against a different target.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub method: Method,

    /// Origin-form target exactly as the client sent it (`/example.com/path?q`).
    pub uri: Uri,

    pub version: Version,

    pub headers: HeaderMap,

    pub body: BodyBuffer,
}

impl Default for RequestParts {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::from_static("/"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: BodyBuffer::default(),
        }
    }
}

impl RequestParts {
    /// Path plus query of the request target.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseParts {
    pub status: StatusCode,

    pub version: Version,

    pub headers: HeaderMap,

    pub body: BodyBuffer,
}

impl ResponseParts {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: BodyBuffer::default(),
        }
    }
}

/// Fully buffered message body. Rewriting needs the whole document, so nothing here
/// streams.
#[derive(Debug, Clone, Default)]
pub struct BodyBuffer {
    data: BytesMut,
}

impl BodyBuffer {
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn replace(&mut self, chunk: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

impl From<&[u8]> for BodyBuffer {
    fn from(chunk: &[u8]) -> Self {
        Self {
            data: BytesMut::from(chunk),
        }
    }
}

/// Scratchpad the stages and the dispatcher fill in; telemetry reads it once the
/// response has been written.
#[derive(Debug, Default)]
pub struct FlowMetadata {
    /// Client identity used as the history key.
    pub source_id: String,

    /// Where the request was actually sent. Set before the request stages run.
    pub target: Option<TargetAddress>,

    pub content_kind: Option<ContentKind>,

    /// `Content-Encoding` removed before rewriting, if any.
    pub decoded_from: Option<String>,

    /// Upstream body size before rewriting.
    pub upstream_bytes: usize,

    /// True when the first attempt failed and the history fallback answered.
    pub retried: bool,

    /// Which local route answered instead of upstream (`landing`, `redirect`, ...).
    pub local_route: Option<&'static str>,

    pub started_at: Option<Instant>,
}

impl FlowMetadata {
    pub fn elapsed_ms(&self) -> Option<u128> {
        self.started_at.map(|start| start.elapsed().as_millis())
    }
}
