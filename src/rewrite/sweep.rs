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

static PLAIN_ABSOLUTE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b[a-zA-Z][a-zA-Z0-9+.-]*://[\w-]+(?:\.[\w-]+)+(?::\d+)?(?:[\w.,@?^=%&:/~+#-]*[\w@?^=%&/~+#-])?",
    )
    .expect("absolute url pattern compiles")
});

static ESCAPED_ABSOLUTE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[a-zA-Z][a-zA-Z0-9+.-]*:\\/\\/[\w-]+(?:\.[\w-]+)+(?::\d+)?(?:\\/[\w.,@?^=%&:~+#-]*)*")
        .expect("escaped absolute url pattern compiles")
});

/// Last pass over every rewritable body: any absolute URL still pointing somewhere
/// other than the proxy is encoded, including the `https:\/\/host\/path` form that
/// JSON serializers emit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsoluteUrlSweep;

impl AbsoluteUrlSweep {
    fn plain<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        PLAIN_ABSOLUTE_URL.replace_all(body, |caps: &Captures<'_>| match utf8(&caps[0]) {
            Some(literal) => ctx.rewrite_url(literal).into_bytes(),
            None => caps[0].to_vec(),
        })
    }

    fn escaped<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        ESCAPED_ABSOLUTE_URL.replace_all(body, |caps: &Captures<'_>| {
            let Some(literal) = utf8(&caps[0]) else {
                return caps[0].to_vec();
            };
            let unescaped = literal.replace(r"\/", "/");
            let rewritten = ctx.rewrite_url(&unescaped);
            if rewritten == unescaped {
                return caps[0].to_vec();
            }
            rewritten.replace('/', r"\/").into_bytes()
        })
    }
}

impl RewriteRule for AbsoluteUrlSweep {
    fn name(&self) -> &'static str {
        "absolute-url-sweep"
    }

    fn apply<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        let plain = self.plain(body, ctx);
        let escaped = match self.escaped(&plain, ctx) {
            Cow::Borrowed(_) => None,
            Cow::Owned(bytes) => Some(bytes),
        };
        match escaped {
            Some(bytes) => Cow::Owned(bytes),
            None => plain,
        }
    }
}
