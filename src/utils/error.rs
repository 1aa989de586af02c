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

use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid proxy origin: {0}")]
    InvalidOrigin(String),

    #[error("Unsupported upstream scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Upstream {host} unreachable: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("Malformed HTTP message: {0}")]
    Protocol(String),

    #[error("Body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}
