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

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Well-known scheme/port pairs. Order matters for the reverse lookup: when two
/// schemes share a port the first one listed owns it (`http` over `ws`).
const WELL_KNOWN: &[(&str, u16)] = &[
    ("http", 80),
    ("https", 443),
    ("ws", 80),
    ("wss", 443),
    ("ftp", 21),
    ("ssh", 22),
    ("sftp", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("dns", 53),
    ("gopher", 70),
    ("finger", 79),
    ("pop3", 110),
    ("nntp", 119),
    ("ntp", 123),
    ("imap", 143),
    ("snmp", 161),
    ("irc", 194),
    ("ldap", 389),
    ("smtps", 465),
    ("rtsp", 554),
    ("ipp", 631),
    ("ldaps", 636),
    ("ftps", 990),
    ("imaps", 993),
    ("pop3s", 995),
    ("mqtt", 1883),
    ("rtmp", 1935),
    ("nfs", 2049),
    ("mysql", 3306),
    ("rdp", 3389),
    ("svn", 3690),
    ("sip", 5060),
    ("sips", 5061),
    ("xmpp", 5222),
    ("postgres", 5432),
    ("amqp", 5672),
    ("vnc", 5900),
    ("redis", 6379),
    ("ircs", 6697),
    ("git", 9418),
    ("mongodb", 27017),
];

static STANDARD: Lazy<ProtocolTable> = Lazy::new(|| ProtocolTable::from_pairs(WELL_KNOWN));

/// Bidirectional scheme <-> canonical port lookup. Schemes are stored without the
/// trailing colon and compared case-insensitively.
#[derive(Debug, Clone)]
pub struct ProtocolTable {
    by_scheme: HashMap<String, u16>,
    by_port: HashMap<u16, String>,
}

impl ProtocolTable {
    /// Process-wide table built from the well-known list on first use.
    pub fn standard() -> &'static ProtocolTable {
        &STANDARD
    }

    pub fn from_pairs(pairs: &[(&str, u16)]) -> Self {
        let mut by_scheme = HashMap::with_capacity(pairs.len());
        let mut by_port = HashMap::with_capacity(pairs.len());
        for (scheme, port) in pairs {
            by_scheme.insert(scheme.to_ascii_lowercase(), *port);
            by_port
                .entry(*port)
                .or_insert_with(|| scheme.to_ascii_lowercase());
        }
        Self { by_scheme, by_port }
    }

    /// Canonical port for a scheme. Accepts `https` as well as `https:`.
    pub fn port_for(&self, scheme: &str) -> Option<u16> {
        let scheme = scheme.trim_end_matches(':').to_ascii_lowercase();
        self.by_scheme.get(&scheme).copied()
    }

    /// Scheme that owns a port, if any. Callers decide the fallback.
    pub fn scheme_for(&self, port: u16) -> Option<&str> {
        self.by_port.get(&port).map(String::as_str)
    }

    pub fn knows(&self, scheme: &str) -> bool {
        self.port_for(scheme).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_scheme.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_scheme.is_empty()
    }
}
