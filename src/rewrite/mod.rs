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

//! Body rewriting. Each rule is a pure transform over a fully buffered body; a
//! [`ContentPipeline`] chains the rules that apply to one content kind, and the
//! [`RewriteEngine`] picks the pipeline from the response `Content-Type`.
//!
//! The rules are regex based on purpose: third-party markup is frequently malformed,
//! and a missed URL is a better failure than a rejected page.

mod css;
mod html;
mod script;
mod sweep;

pub use css::CssUrlRule;
pub use html::{AttributeRule, IntegrityRule};
pub use script::ScriptLiteralRule;
pub use sweep::AbsoluteUrlSweep;

use std::{borrow::Cow, fmt, sync::Arc};

use http::{header::CONTENT_TYPE, HeaderMap};

use crate::address::{AddressCodec, TargetAddress};

/// What a rule needs to rewrite a URL: the codec and the page the body belongs to.
#[derive(Clone, Copy)]
pub struct RewriteContext<'a> {
    pub codec: &'a AddressCodec,
    pub page: &'a TargetAddress,
}

impl<'a> RewriteContext<'a> {
    pub fn new(codec: &'a AddressCodec, page: &'a TargetAddress) -> Self {
        Self { codec, page }
    }

    pub fn rewrite_url(&self, literal: &str) -> String {
        self.codec.rewrite_url(literal, self.page)
    }
}

pub trait RewriteRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `Cow::Borrowed` when nothing matched.
    fn apply<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]>;
}

/// Response categories that select a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Html,
    Css,
    Script,
    /// JSON / XML feeds: only the generic URL sweep applies.
    Data,
    /// Anything else, including a missing header. Relayed untouched.
    Opaque,
}

impl ContentKind {
    /// Classifies a raw `Content-Type` value. Only the first value of a comma-joined
    /// header counts, parameters are ignored, and the comparison is case-insensitive.
    pub fn from_content_type(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return ContentKind::Opaque;
        };
        let mime = value
            .split(',')
            .next()
            .and_then(|first| first.split(';').next())
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "text/html" | "application/xhtml+xml" => ContentKind::Html,
            "text/css" => ContentKind::Css,
            "text/javascript"
            | "application/javascript"
            | "application/x-javascript"
            | "application/ecmascript"
            | "text/ecmascript" => ContentKind::Script,
            "application/json"
            | "application/manifest+json"
            | "text/xml"
            | "application/xml"
            | "application/rss+xml"
            | "application/atom+xml" => ContentKind::Data,
            _ => ContentKind::Opaque,
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_content_type(headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()))
    }

    pub fn is_rewritable(self) -> bool {
        self != ContentKind::Opaque
    }

    pub fn label(self) -> &'static str {
        match self {
            ContentKind::Html => "html",
            ContentKind::Css => "css",
            ContentKind::Script => "script",
            ContentKind::Data => "data",
            ContentKind::Opaque => "opaque",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered rules for one content kind.
#[derive(Clone)]
pub struct ContentPipeline {
    kind: ContentKind,
    rules: Vec<Arc<dyn RewriteRule>>,
}

impl ContentPipeline {
    pub fn new(kind: ContentKind, rules: Vec<Arc<dyn RewriteRule>>) -> Self {
        Self { kind, rules }
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    pub fn run(&self, body: &[u8], ctx: &RewriteContext<'_>) -> Vec<u8> {
        let mut current = body.to_vec();
        for rule in &self.rules {
            let next = match rule.apply(&current, ctx) {
                Cow::Borrowed(_) => continue,
                Cow::Owned(next) => next,
            };
            tracing::trace!(rule = rule.name(), before = current.len(), after = next.len(), "rewrite rule applied");
            current = next;
        }
        current
    }
}

/// Holds one pipeline per rewritable content kind.
#[derive(Clone)]
pub struct RewriteEngine {
    html: ContentPipeline,
    css: ContentPipeline,
    script: ContentPipeline,
    data: ContentPipeline,
}

impl Default for RewriteEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RewriteEngine {
    /// `script_heuristics` toggles the domain-comparison rewrite inside script literals.
    pub fn new(script_heuristics: bool) -> Self {
        let script_literals: Arc<dyn RewriteRule> = Arc::new(ScriptLiteralRule::new(script_heuristics));
        let css_urls: Arc<dyn RewriteRule> = Arc::new(CssUrlRule);
        let sweep: Arc<dyn RewriteRule> = Arc::new(AbsoluteUrlSweep);

        Self {
            html: ContentPipeline::new(
                ContentKind::Html,
                vec![
                    script_literals.clone(),
                    Arc::new(AttributeRule),
                    Arc::new(IntegrityRule),
                    css_urls.clone(),
                    sweep.clone(),
                ],
            ),
            css: ContentPipeline::new(ContentKind::Css, vec![css_urls, sweep.clone()]),
            script: ContentPipeline::new(ContentKind::Script, vec![script_literals, sweep.clone()]),
            data: ContentPipeline::new(ContentKind::Data, vec![sweep]),
        }
    }

    pub fn pipeline(&self, kind: ContentKind) -> Option<&ContentPipeline> {
        match kind {
            ContentKind::Html => Some(&self.html),
            ContentKind::Css => Some(&self.css),
            ContentKind::Script => Some(&self.script),
            ContentKind::Data => Some(&self.data),
            ContentKind::Opaque => None,
        }
    }

    /// Rewrites `body` for `kind`; `None` means the body must be relayed as-is.
    pub fn rewrite(&self, kind: ContentKind, body: &[u8], ctx: &RewriteContext<'_>) -> Option<Vec<u8>> {
        self.pipeline(kind).map(|pipeline| pipeline.run(body, ctx))
    }
}

/// Rebuilds a capture group as UTF-8; rules skip matches that are not valid text.
pub(crate) fn utf8(bytes: &[u8]) -> Option<&str> {
    std::str::from_utf8(bytes).ok()
}
