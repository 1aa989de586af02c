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

/// Top-level domains the comparison heuristic recognises.
const COMPARISON_TLDS: &str = "com|net|org|io|co|dev|app|edu|gov|info|me|tv|us|uk|de";

static PROTOCOL_RELATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(["'])//([\w-]+(?:\.[\w-]+)+)/"#).expect("protocol-relative pattern compiles")
});

static ESCAPED_PROTOCOL_RELATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(["'])\\/\\/([\w-]+(?:\.[\w-]+)+)\\/"#)
        .expect("escaped protocol-relative pattern compiles")
});

static DOMAIN_BEFORE_COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"(["'])((?:[\w-]+\.)+(?:{COMPARISON_TLDS}))(["'])(\s*[!=]==?)"#
    ))
    .expect("left comparison pattern compiles")
});

static DOMAIN_AFTER_COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"([!=]==?\s*)(["'])((?:[\w-]+\.)+(?:{COMPARISON_TLDS}))(["'])"#
    ))
    .expect("right comparison pattern compiles")
});

static SOURCE_MAP_COMMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)//[#@][ \t]*sourceMappingURL=[^\r\n]*").expect("source map pattern compiles")
});

/// Rewrites URL-ish string literals inside scripts:
///
/// 1. `"//host.tld/` becomes `"//<proxy>/host.tld/`,
/// 2. the JSON-escaped `"\/\/host.tld\/` form gets the same treatment,
/// 3. optionally, `"host.tld" == x` / `x === "host.tld"` compare against the proxy
///    hostname instead, which defeats naive origin checks in third-party code,
/// 4. `//# sourceMappingURL=` comments are dropped.
///
/// Step 3 is a heuristic and can miss or over-match; it is switched off with
/// `proxy.script_heuristics = false`.
#[derive(Debug, Clone, Copy)]
pub struct ScriptLiteralRule {
    comparisons: bool,
}

impl Default for ScriptLiteralRule {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ScriptLiteralRule {
    pub fn new(comparisons: bool) -> Self {
        Self { comparisons }
    }

    fn protocol_relative<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        let authority = ctx.codec.origin().authority().as_bytes();
        PROTOCOL_RELATIVE.replace_all(body, |caps: &Captures<'_>| {
            if points_at_proxy(&caps[2], ctx) {
                return caps[0].to_vec();
            }
            let mut out = Vec::with_capacity(caps[0].len() + authority.len() + 2);
            out.extend_from_slice(&caps[1]);
            out.extend_from_slice(b"//");
            out.extend_from_slice(authority);
            out.push(b'/');
            out.extend_from_slice(&caps[2]);
            out.push(b'/');
            out
        })
    }

    fn escaped_protocol_relative<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        let authority = ctx.codec.origin().authority().as_bytes();
        ESCAPED_PROTOCOL_RELATIVE.replace_all(body, |caps: &Captures<'_>| {
            if points_at_proxy(&caps[2], ctx) {
                return caps[0].to_vec();
            }
            let mut out = Vec::with_capacity(caps[0].len() + authority.len() + 4);
            out.extend_from_slice(&caps[1]);
            out.extend_from_slice(br"\/\/");
            out.extend_from_slice(authority);
            out.extend_from_slice(br"\/");
            out.extend_from_slice(&caps[2]);
            out.extend_from_slice(br"\/");
            out
        })
    }

    fn domain_comparisons<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        let hostname = ctx.codec.origin().hostname().as_bytes();

        let left = DOMAIN_BEFORE_COMPARISON.replace_all(body, |caps: &Captures<'_>| {
            if points_at_proxy(&caps[2], ctx) {
                return caps[0].to_vec();
            }
            [&caps[1], hostname, &caps[3], &caps[4]].concat()
        });

        let right = owned(DOMAIN_AFTER_COMPARISON.replace_all(&left, |caps: &Captures<'_>| {
            if points_at_proxy(&caps[3], ctx) {
                return caps[0].to_vec();
            }
            [&caps[1], &caps[2], hostname, &caps[4]].concat()
        }));

        match right {
            Some(bytes) => Cow::Owned(bytes),
            None => left,
        }
    }
}

impl RewriteRule for ScriptLiteralRule {
    fn name(&self) -> &'static str {
        "script-literal"
    }

    fn apply<'b>(&self, body: &'b [u8], ctx: &RewriteContext<'_>) -> Cow<'b, [u8]> {
        let mut current = Cow::Borrowed(body);

        let next = owned(self.protocol_relative(&current, ctx));
        if let Some(next) = next {
            current = Cow::Owned(next);
        }

        let next = owned(self.escaped_protocol_relative(&current, ctx));
        if let Some(next) = next {
            current = Cow::Owned(next);
        }

        if self.comparisons {
            let next = owned(self.domain_comparisons(&current, ctx));
            if let Some(next) = next {
                current = Cow::Owned(next);
            }
        }

        let next = owned(SOURCE_MAP_COMMENT.replace_all(&current, &b""[..]));
        if let Some(next) = next {
            current = Cow::Owned(next);
        }

        current
    }
}

fn owned(result: Cow<'_, [u8]>) -> Option<Vec<u8>> {
    match result {
        Cow::Borrowed(_) => None,
        Cow::Owned(bytes) => Some(bytes),
    }
}

fn points_at_proxy(host: &[u8], ctx: &RewriteContext<'_>) -> bool {
    utf8(host).map_or(true, |host| ctx.codec.points_at_proxy(host))
}
