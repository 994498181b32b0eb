//! The probing engine: decides which servers need a fresh measurement,
//! runs one cancellable task per server, reduces the noisy samples to a
//! lower-median estimate and publishes the result.

use futures::FutureExt;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::probe::ProbeTransport;
use crate::state::{Registry, ServerDescriptor};

const EVENT_CAPACITY: usize = 64;

/// A fresh latency measurement for one server.
#[derive(Debug, Clone)]
pub struct PingEvent {
    pub server: ServerDescriptor,
    /// Lower-median round-trip time across the sampled rounds.
    pub ping: Duration,
}

/// Tracks candidate relay servers and their measured latency.
///
/// Registry mutations run synchronously and never block on probing;
/// [`PingTracker::refresh_pings`] launches detached probe tasks and returns
/// as soon as every launch decision is made. Subscribers receive one
/// [`PingEvent`] per successful measurement and nothing for servers that
/// stay unreachable.
pub struct PingTracker<T> {
    transport: Arc<T>,
    config: Config,
    registry: Arc<RwLock<Registry>>,
    events: broadcast::Sender<PingEvent>,
}

impl<T> Clone for PingTracker<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
        }
    }
}

impl<T: ProbeTransport + 'static> PingTracker<T> {
    pub fn new(transport: T, config: Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport: Arc::new(transport),
            config,
            registry: Arc::new(RwLock::new(Registry::new())),
            events,
        }
    }

    /// Subscribe to ping events. Emissions for the same server repeat over
    /// time; a server that cannot be reached never emits.
    pub fn subscribe(&self) -> broadcast::Receiver<PingEvent> {
        self.events.subscribe()
    }

    /// Replace the whole server set. Cancels every in-flight probe and
    /// clears all cached pings; no task launched before this call can still
    /// write a result.
    pub fn set_servers(&self, servers: Vec<ServerDescriptor>) {
        self.registry.write().replace_all(servers);
    }

    /// Insert or update one server, per the endpoint-identity rules of
    /// [`Registry::upsert`].
    pub fn upsert_server(&self, descriptor: ServerDescriptor) {
        self.registry.write().upsert(descriptor);
    }

    /// Remove one server, cancelling its in-flight probe if any.
    pub fn delete_server(&self, id: u32) {
        self.registry.write().remove(id);
    }

    /// Cached latency for one server, if a probe has succeeded and the
    /// registry has not since evicted it. `None` covers both "never probed"
    /// and "probed but unreachable".
    pub fn cached_ping(&self, id: u32) -> Option<Duration> {
        self.registry.read().cached_ping(id)
    }

    /// Snapshot of every cached latency.
    pub fn pings(&self) -> HashMap<u32, Duration> {
        self.registry.read().ping_snapshot()
    }

    /// Launch a probe task for every server without a fresh cached ping.
    /// Fire-and-forget: returns once the tasks are spawned, never waits for
    /// them and never fails. Servers that are already mid-probe or whose
    /// cache entry is younger than the staleness window are skipped.
    pub async fn refresh_pings(&self) {
        if let Err(e) = self.transport.bind().await {
            warn!(error = %e, "probe transport bind failed, skipping refresh");
            return;
        }

        let launches = self
            .registry
            .write()
            .begin_probes(Instant::now(), self.config.staleness);

        for (descriptor, cancel) in launches {
            let server_id = descriptor.id;
            let registry = Arc::clone(&self.registry);
            let task = probe_server(
                Arc::clone(&self.transport),
                self.config.clone(),
                Arc::clone(&self.registry),
                self.events.clone(),
                descriptor,
                cancel.clone(),
            );
            // a panicking transport must not wedge the server: catch it at
            // the task boundary, log it, and unblock future refreshes
            tokio::spawn(async move {
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    warn!(server = server_id, "probe task panicked");
                    let mut registry = registry.write();
                    if !cancel.is_cancelled() {
                        // still our entry; a cancelled token means it was
                        // already removed or replaced, with its own probe
                        registry.finish_probe(server_id);
                    }
                }
            });
        }
    }
}

/// One server's probing run: jittered start, `attempts` sequential rounds,
/// lower-median reduction, cache write plus event. Cancellation is observed
/// at every round boundary and once more under the write lock before the
/// cache write, so a registry rewrite can never race a late result in.
async fn probe_server<T: ProbeTransport>(
    transport: Arc<T>,
    config: Config,
    registry: Arc<RwLock<Registry>>,
    events: broadcast::Sender<PingEvent>,
    server: ServerDescriptor,
    cancel: CancellationToken,
) {
    let targets = server.probe_targets();

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(startup_delay(&config)) => {}
    }

    let mut samples = Vec::new();
    for round in 0..config.attempts {
        if cancel.is_cancelled() {
            return;
        }
        match transport.ping_batch(&targets).await {
            Ok(replies) => samples.extend(
                replies
                    .into_iter()
                    .filter(|r| r.answered())
                    .map(|r| r.time_ms),
            ),
            // a failed round contributes no samples; probing continues
            Err(e) => debug!(server = server.id, error = %e, "probe round failed"),
        }
        if round + 1 < config.attempts {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(round_delay(&config)) => {}
            }
        }
    }

    let mut registry = registry.write();
    if cancel.is_cancelled() {
        // entry was removed or replaced while the last round was in flight
        return;
    }
    registry.finish_probe(server.id);
    if samples.is_empty() {
        drop(registry);
        debug!(server = server.id, "no probe responses, leaving ping uncached");
        return;
    }
    let ping = Duration::from_secs_f64(lower_median(&mut samples) / 1000.0);
    registry.record_ping(server.id, ping, Instant::now());
    drop(registry);

    debug!(server = server.id, ping_ms = ping.as_secs_f64() * 1000.0, "ping updated");
    let _ = events.send(PingEvent { server, ping });
}

/// Sorted-ascending element at index `n/2`. Deliberately the lower median
/// for even counts rather than an average of the middle two: a single bad
/// round cannot drag the estimate, and no interpolated value is invented.
fn lower_median(samples: &mut [f64]) -> f64 {
    samples.sort_unstable_by(f64::total_cmp);
    samples[samples.len() / 2]
}

fn startup_delay(config: &Config) -> Duration {
    if config.jitter.is_zero() {
        return Duration::ZERO;
    }
    config.jitter.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
}

fn round_delay(config: &Config) -> Duration {
    if config.jitter.is_zero() {
        return config.base_interval;
    }
    let jitter_ms = config.jitter.as_secs_f64() * 1000.0;
    let offset = rand::thread_rng().gen_range(-jitter_ms..jitter_ms);
    let ms = (config.base_interval.as_secs_f64() * 1000.0 + offset).max(0.0);
    Duration::from_secs_f64(ms / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lower_median_of_two_is_the_larger() {
        assert_eq!(lower_median(&mut [20.0, 22.0]), 22.0);
        assert_eq!(lower_median(&mut [22.0, 20.0]), 22.0);
    }

    #[test]
    fn lower_median_of_one() {
        assert_eq!(lower_median(&mut [37.5]), 37.5);
    }

    #[test]
    fn lower_median_odd_count_is_the_middle() {
        assert_eq!(lower_median(&mut [5.0, 1.0, 3.0]), 3.0);
    }

    #[test]
    fn lower_median_resists_one_outlier_round() {
        // four good samples plus one wild one from a congested round
        assert_eq!(lower_median(&mut [21.0, 20.0, 950.0, 22.0, 19.0]), 21.0);
    }

    #[test]
    fn round_delay_without_jitter_is_exact() {
        let config = Config {
            jitter: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(round_delay(&config), config.base_interval);
        assert_eq!(startup_delay(&config), Duration::ZERO);
    }

    #[test]
    fn delays_stay_within_the_jittered_bounds() {
        let config = Config::default();
        for _ in 0..200 {
            assert!(startup_delay(&config) < config.jitter);
            let d = round_delay(&config);
            assert!(d < config.base_interval + config.jitter);
        }
    }

    proptest! {
        #[test]
        fn lower_median_is_order_independent(
            mut samples in prop::collection::vec(0.0f64..1_000_000.0, 1..64),
        ) {
            let mut sorted = samples.clone();
            sorted.sort_unstable_by(f64::total_cmp);
            let expected = sorted[sorted.len() / 2];

            samples.reverse();
            prop_assert_eq!(lower_median(&mut samples), expected);
            // a member of the input, never an interpolated value
            prop_assert!(sorted.contains(&expected));
        }
    }
}
