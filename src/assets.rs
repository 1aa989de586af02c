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

use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;

const BUILTIN_LANDING_PAGE: &str = include_str!("../assets/index.html");

/// HTML served on `/`.
#[derive(Clone)]
pub struct LandingPage {
    pub html: Bytes,
}

impl LandingPage {
    pub fn builtin() -> Self {
        Self {
            html: Bytes::from_static(BUILTIN_LANDING_PAGE.as_bytes()),
        }
    }

    /// Reads the configured page, or falls back to the one compiled into the binary.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::builtin());
        };
        let html = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read landing page: {}", path.display()))?;
        tracing::debug!(path = %path.display(), bytes = html.len(), "loaded landing page");
        Ok(Self { html: Bytes::from(html) })
    }
}
