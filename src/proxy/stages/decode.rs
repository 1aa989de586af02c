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

use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use async_trait::async_trait;
use brotli::Decompressor;
use flate2::read::{GzDecoder, ZlibDecoder};
use http::header::CONTENT_ENCODING;

use super::FlowStage;
use crate::{
    proxy::flow::{Flow, ResponseParts},
    utils::ProxyError,
};

/// Turns compressed rewritable bodies back into plain bytes so the rewrite stage sees
/// text. Opaque bodies keep their encoding and are relayed as received.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentDecodeStage {
    max_body: Option<usize>,
}

impl ContentDecodeStage {
    pub fn new(max_body: Option<usize>) -> Self {
        Self { max_body }
    }

    /// Returns the `Content-Encoding` that was removed. Unknown encodings leave the body
    /// and header untouched.
    fn ensure_plain_body(&self, response: &mut ResponseParts) -> Result<Option<String>> {
        let Some(raw) = response.headers.get(CONTENT_ENCODING) else {
            return Ok(None);
        };
        let label = raw.to_str().unwrap_or_default().to_string();
        let encodings: Vec<String> = label
            .split(',')
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty() && token != "identity")
            .collect();

        if encodings.is_empty() {
            response.headers.remove(CONTENT_ENCODING);
            return Ok(None);
        }

        let mut decoded = response.body.as_bytes().to_vec();
        for encoding in encodings.iter().rev() {
            decoded = match encoding.as_str() {
                "gzip" | "x-gzip" => self.drain(GzDecoder::new(&decoded[..]))?,
                "deflate" => self.drain(ZlibDecoder::new(&decoded[..]))?,
                "br" => self.drain(Decompressor::new(Cursor::new(&decoded[..]), 4096))?,
                other => {
                    tracing::debug!(encoding = %other, "unsupported content-encoding, relaying as-is");
                    return Ok(None);
                }
            };
        }

        response.body.replace(&decoded);
        response.headers.remove(CONTENT_ENCODING);
        Ok(Some(label))
    }

    fn drain(&self, mut reader: impl Read) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self.max_body {
            Some(limit) => {
                reader
                    .take(limit as u64 + 1)
                    .read_to_end(&mut out)
                    .context("failed to decode response body")?;
                if out.len() > limit {
                    return Err(ProxyError::BodyTooLarge { limit }.into());
                }
            }
            None => {
                reader
                    .read_to_end(&mut out)
                    .context("failed to decode response body")?;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl FlowStage for ContentDecodeStage {
    fn name(&self) -> &'static str {
        "content-decode"
    }

    async fn on_response_body(&self, flow: &mut Flow) -> Result<()> {
        let rewritable = flow.metadata.content_kind.is_some_and(|kind| kind.is_rewritable());
        let Some(response) = flow.response.as_mut() else {
            return Ok(());
        };
        if !rewritable || response.body.is_empty() {
            return Ok(());
        }

        if let Some(label) = self.ensure_plain_body(response)? {
            tracing::trace!(flow_id = %flow.id, encoding = %label, bytes = response.body.len(), "decoded response body");
            flow.metadata.decoded_from = Some(label);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};
    use http::{HeaderValue, StatusCode};

    use super::*;
    use crate::{proxy::flow::RequestParts, rewrite::ContentKind};

    fn flow(kind: ContentKind, encoding: &'static str, body: &[u8]) -> Flow {
        let mut flow = Flow::new(RequestParts::default(), "127.0.0.1");
        let mut response = ResponseParts::new(StatusCode::OK);
        response
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        response.body.push_bytes(body);
        flow.response = Some(response);
        flow.metadata.content_kind = Some(kind);
        flow
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn brotli(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(data).unwrap();
        }
        out
    }

    #[tokio::test]
    async fn gzip_html_is_decoded() {
        let mut flow = flow(ContentKind::Html, "gzip", &gzip(b"<a href=\"/x\">x</a>"));
        ContentDecodeStage::default().on_response_body(&mut flow).await.unwrap();

        let response = flow.response.as_ref().unwrap();
        assert_eq!(response.body.as_bytes(), b"<a href=\"/x\">x</a>");
        assert!(!response.headers.contains_key(CONTENT_ENCODING));
        assert_eq!(flow.metadata.decoded_from.as_deref(), Some("gzip"));
    }

    #[tokio::test]
    async fn brotli_script_is_decoded() {
        let mut flow = flow(ContentKind::Script, "br", &brotli(b"var a = 1;"));
        ContentDecodeStage::default().on_response_body(&mut flow).await.unwrap();
        assert_eq!(flow.response.unwrap().body.as_bytes(), b"var a = 1;");
    }

    #[tokio::test]
    async fn opaque_and_unknown_encodings_are_left_alone() {
        let packed = gzip(b"PNG");
        let mut image = flow(ContentKind::Opaque, "gzip", &packed);
        ContentDecodeStage::default().on_response_body(&mut image).await.unwrap();
        assert_eq!(image.response.unwrap().body.as_bytes(), &packed[..]);

        let mut zstd = flow(ContentKind::Html, "zstd", b"\x28\xb5\x2f\xfd");
        ContentDecodeStage::default().on_response_body(&mut zstd).await.unwrap();
        let response = zstd.response.unwrap();
        assert_eq!(response.headers[CONTENT_ENCODING], "zstd");
        assert_eq!(response.body.as_bytes(), b"\x28\xb5\x2f\xfd");
    }

    #[tokio::test]
    async fn decoded_body_respects_limit() {
        let mut flow = flow(ContentKind::Html, "gzip", &gzip(&[b'a'; 4096]));
        let err = ContentDecodeStage::new(Some(1024))
            .on_response_body(&mut flow)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProxyError>(),
            Some(ProxyError::BodyTooLarge { limit: 1024 })
        ));
    }
}
