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

static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(["']?)([^"')]*)(["']?)\s*\)"#).expect("css url pattern compiles")
});

/// Rewrites `url(...)` references in stylesheets and inline styles. Quoted and bare
/// forms are both handled; the quotes are kept as found.
#[derive(Debug, Clone, Copy, Default)]
pub struct CssUrlRule;

impl RewriteRule for CssUrlRule {
    fn name(&self) -> &'static str {
        "css-url"
    }

    fn apply<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        CSS_URL.replace_all(body, |caps: &Captures<'_>| {
            let Some(literal) = utf8(&caps[2]) else {
                return caps[0].to_vec();
            };
            let rewritten = ctx.rewrite_url(literal);
            if rewritten == literal {
                return caps[0].to_vec();
            }

            let mut out = Vec::with_capacity(rewritten.len() + 8);
            out.extend_from_slice(b"url(");
            out.extend_from_slice(&caps[1]);
            out.extend_from_slice(rewritten.as_bytes());
            out.extend_from_slice(&caps[3]);
            out.push(b')');
            out
        })
    }
}
