//! In-memory registry of candidate relay servers plus the ping cache.
//!
//! Every mutation runs synchronously under the caller's write lock, so a
//! probe task that re-checks its cancellation token under the same lock can
//! never race a registry rewrite: tokens are cancelled and cache entries
//! evicted before the lock is released.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::state::server::{PingResult, ServerDescriptor};

/// One registered server and its probing lifecycle.
#[derive(Debug)]
pub struct RegistryEntry {
    pub descriptor: ServerDescriptor,
    /// Observed by the in-flight probe task at round boundaries. Cancelled
    /// whenever this entry is removed or replaced by a new endpoint.
    pub cancel: CancellationToken,
    /// True while a probe task launched for this entry is still running.
    pub probing: bool,
}

impl RegistryEntry {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            cancel: CancellationToken::new(),
            probing: false,
        }
    }
}

/// Registered servers keyed by id, with cached measurements alongside.
#[derive(Debug, Default)]
pub struct Registry {
    servers: HashMap<u32, RegistryEntry>,
    pings: HashMap<u32, PingResult>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard everything: cancel every in-flight probe, clear the whole
    /// cache, install the new set with fresh tokens.
    pub fn replace_all(&mut self, descriptors: impl IntoIterator<Item = ServerDescriptor>) {
        for entry in self.servers.values() {
            entry.cancel.cancel();
        }
        self.pings.clear();
        self.servers = descriptors
            .into_iter()
            .map(|d| (d.id, RegistryEntry::new(d)))
            .collect();
    }

    /// Insert or update one server. A changed endpoint counts as a new
    /// server: the old probe is cancelled and the cached ping evicted. An
    /// unchanged endpoint only swaps the descriptor, leaving the cache and
    /// any in-flight probe alone.
    pub fn upsert(&mut self, descriptor: ServerDescriptor) {
        match self.servers.get_mut(&descriptor.id) {
            Some(entry) if entry.descriptor.same_endpoint(&descriptor) => {
                entry.descriptor = descriptor;
            }
            Some(entry) => {
                entry.cancel.cancel();
                self.pings.remove(&descriptor.id);
                *entry = RegistryEntry::new(descriptor);
            }
            None => {
                self.servers.insert(descriptor.id, RegistryEntry::new(descriptor));
            }
        }
    }

    /// Remove one server, cancelling its probe and evicting its cached ping.
    /// No-op for unknown ids.
    pub fn remove(&mut self, id: u32) {
        if let Some(entry) = self.servers.remove(&id) {
            entry.cancel.cancel();
        }
        self.pings.remove(&id);
    }

    /// Mark every server that needs a fresh measurement as probing and hand
    /// back what the launcher needs: the descriptor snapshot and the entry's
    /// token. Skips servers that are mid-probe, have no addresses, or hold a
    /// cache entry younger than `staleness` (age exactly equal counts as
    /// stale).
    pub fn begin_probes(
        &mut self,
        now: Instant,
        staleness: Duration,
    ) -> Vec<(ServerDescriptor, CancellationToken)> {
        let mut launches = Vec::new();
        for (id, entry) in &mut self.servers {
            if entry.probing || entry.descriptor.probe_targets().is_empty() {
                continue;
            }
            let fresh = self
                .pings
                .get(id)
                .is_some_and(|p| now.duration_since(p.last_pinged) < staleness);
            if fresh {
                continue;
            }
            entry.probing = true;
            launches.push((entry.descriptor.clone(), entry.cancel.clone()));
        }
        launches
    }

    /// Clear the probing flag after a task settles. Cancelled tasks never
    /// call this; their entry has already been removed or replaced.
    pub fn finish_probe(&mut self, id: u32) {
        if let Some(entry) = self.servers.get_mut(&id) {
            entry.probing = false;
        }
    }

    pub fn record_ping(&mut self, id: u32, ping: Duration, now: Instant) {
        self.pings.insert(
            id,
            PingResult {
                ping,
                last_pinged: now,
            },
        );
    }

    pub fn cached_ping(&self, id: u32) -> Option<Duration> {
        self.pings.get(&id).map(|p| p.ping)
    }

    pub fn ping_snapshot(&self) -> HashMap<u32, Duration> {
        self.pings.iter().map(|(&id, p)| (id, p.ping)).collect()
    }

    pub fn descriptor(&self, id: u32) -> Option<&ServerDescriptor> {
        self.servers.get(&id).map(|e| &e.descriptor)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const STALENESS: Duration = Duration::from_secs(30 * 60);

    fn server(id: u32, port: u16) -> ServerDescriptor {
        ServerDescriptor {
            id,
            description: format!("server-{id}"),
            address4: Some(Ipv4Addr::new(192, 0, 2, id as u8)),
            address6: None,
            port,
        }
    }

    #[test]
    fn upsert_same_endpoint_keeps_cache_and_token() {
        let mut registry = Registry::new();
        registry.replace_all([server(1, 14098)]);
        let token = registry.servers[&1].cancel.clone();
        let now = Instant::now();
        registry.record_ping(1, Duration::from_millis(25), now);

        let mut renamed = server(1, 14098);
        renamed.description = "renamed".into();
        registry.upsert(renamed);

        assert!(!token.is_cancelled());
        assert_eq!(registry.cached_ping(1), Some(Duration::from_millis(25)));
        assert_eq!(registry.descriptor(1).unwrap().description, "renamed");
    }

    #[test]
    fn upsert_changed_endpoint_cancels_and_evicts() {
        let mut registry = Registry::new();
        registry.replace_all([server(1, 14098)]);
        let token = registry.servers[&1].cancel.clone();
        registry.record_ping(1, Duration::from_millis(25), Instant::now());

        registry.upsert(server(1, 14099));

        assert!(token.is_cancelled());
        assert_eq!(registry.cached_ping(1), None);
        assert!(!registry.servers[&1].cancel.is_cancelled());
    }

    #[test]
    fn upsert_unknown_id_inserts() {
        let mut registry = Registry::new();
        registry.upsert(server(9, 14098));
        assert_eq!(registry.len(), 1);
        assert!(!registry.servers[&9].cancel.is_cancelled());
    }

    #[test]
    fn remove_cancels_and_evicts() {
        let mut registry = Registry::new();
        registry.replace_all([server(1, 14098)]);
        let token = registry.servers[&1].cancel.clone();
        registry.record_ping(1, Duration::from_millis(25), Instant::now());

        registry.remove(1);

        assert!(token.is_cancelled());
        assert_eq!(registry.cached_ping(1), None);
        assert!(registry.is_empty());

        // removing again is a no-op
        registry.remove(1);
    }

    #[test]
    fn replace_all_cancels_every_probe_and_clears_cache() {
        let mut registry = Registry::new();
        registry.replace_all([server(1, 14098), server(2, 14098)]);
        let t1 = registry.servers[&1].cancel.clone();
        let t2 = registry.servers[&2].cancel.clone();
        registry.record_ping(1, Duration::from_millis(10), Instant::now());

        registry.replace_all([server(2, 14098), server(3, 14098)]);

        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
        assert_eq!(registry.cached_ping(1), None);
        assert_eq!(registry.len(), 2);
        assert!(!registry.servers[&2].cancel.is_cancelled());
    }

    #[test]
    fn begin_probes_skips_fresh_probing_and_addressless() {
        let mut registry = Registry::new();
        let mut no_addr = server(3, 14098);
        no_addr.address4 = None;
        registry.replace_all([server(1, 14098), server(2, 14098), no_addr]);

        let now = Instant::now();
        registry.record_ping(1, Duration::from_millis(25), now);

        let launches = registry.begin_probes(now, STALENESS);
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].0.id, 2);
        assert!(registry.servers[&2].probing);

        // second pass: 2 is mid-probe, nothing else qualifies
        assert!(registry.begin_probes(now, STALENESS).is_empty());

        registry.finish_probe(2);
        registry.record_ping(2, Duration::from_millis(30), now);
        assert!(registry.begin_probes(now, STALENESS).is_empty());
    }

    #[test]
    fn staleness_boundary_counts_as_stale() {
        let mut registry = Registry::new();
        registry.replace_all([server(1, 14098)]);
        let pinged_at = Instant::now();
        registry.record_ping(1, Duration::from_millis(25), pinged_at);

        let just_fresh = pinged_at + STALENESS - Duration::from_millis(1);
        assert!(registry.begin_probes(just_fresh, STALENESS).is_empty());

        let exactly_stale = pinged_at + STALENESS;
        let launches = registry.begin_probes(exactly_stale, STALENESS);
        assert_eq!(launches.len(), 1);
    }
}
