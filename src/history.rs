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

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::address::TargetAddress;

/// How long a client's last target stays usable for reconciliation and retries.
pub const DEFAULT_HISTORY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Scheme, host and non-canonical port of the last target; the path is always empty.
    pub target: TargetAddress,
    pub last_seen_at: Instant,
}

impl HistoryEntry {
    pub fn last_host(&self) -> &str {
        &self.target.hostname
    }
}

/// Per-client memory of the last successfully proxied origin.
///
/// Keys are client source identities (forwarded-for value or peer IP). Entries are
/// overwritten on every successful request and expire lazily: a stale entry is only
/// noticed, and dropped, when it is read.
#[derive(Debug)]
pub struct ClientHistory {
    entries: DashMap<String, HistoryEntry>,
    timeout: Duration,
}

impl Default for ClientHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_TIMEOUT)
    }
}

impl ClientHistory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    pub fn touch(&self, source: &str, target: &TargetAddress, now: Instant) {
        self.entries.insert(
            source.to_string(),
            HistoryEntry {
                target: target.origin(),
                last_seen_at: now,
            },
        );
        tracing::trace!(target: "history", %source, host = %target.hostname, "history updated");
    }

    pub fn get(&self, source: &str, now: Instant) -> Option<HistoryEntry> {
        let expired = match self.entries.get(source) {
            Some(entry) if !self.is_stale(&entry, now) => return Some(entry.value().clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            // Re-check under the shard lock so a concurrent touch is not thrown away.
            self.entries
                .remove_if(source, |_, entry| self.is_stale(entry, now));
            tracing::trace!(target: "history", %source, "history entry expired");
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_stale(&self, entry: &HistoryEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_seen_at) > self.timeout
    }
}
