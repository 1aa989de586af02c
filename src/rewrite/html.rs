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

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};

use super::{utf8, RewriteContext, RewriteRule};

static URL_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(href|src|url)=(["'])([^"']+)["']"#).expect("attribute pattern compiles")
});

static INTEGRITY_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\s+integrity\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#)
        .expect("integrity pattern compiles")
});

/// Rewrites `href=`, `src=` and `url=` attribute values, keeping the attribute name
/// and the opening quote style.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeRule;

impl RewriteRule for AttributeRule {
    fn name(&self) -> &'static str {
        "attribute"
    }

    fn apply<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        URL_ATTRIBUTE.replace_all(body, |caps: &Captures<'_>| {
            let Some(literal) = utf8(&caps[3]) else {
                return caps[0].to_vec();
            };
            let rewritten = ctx.rewrite_url(literal);
            if rewritten == literal {
                return caps[0].to_vec();
            }

            let quote = &caps[2];
            let mut out = Vec::with_capacity(caps[1].len() + rewritten.len() + 3);
            out.extend_from_slice(&caps[1]);
            out.push(b'=');
            out.extend_from_slice(quote);
            out.extend_from_slice(rewritten.as_bytes());
            out.extend_from_slice(quote);
            out
        })
    }
}

/// Drops subresource-integrity attributes: proxied bodies no longer hash to the
/// values the origin published.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityRule;

impl RewriteRule for IntegrityRule {
    fn name(&self) -> &'static str {
        "integrity"
    }

    fn apply<'b>(&self, body: &'b [u8], _ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        INTEGRITY_ATTRIBUTE.replace_all(body, &b""[..])
    }
}
