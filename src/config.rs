use std::time::Duration;

/// Tunables for the probing engine.
///
/// With the defaults, one server's probing run is bounded by roughly
/// `jitter + attempts * (base_interval + jitter)` of wall clock (~320ms)
/// plus the transport's own per-batch timeout.
#[derive(Debug, Clone)]
pub struct Config {
    /// Probe rounds per server per refresh.
    pub attempts: u32,
    /// Nominal delay between rounds.
    pub base_interval: Duration,
    /// Startup delay is uniform in `[0, jitter)`; each inter-round delay is
    /// `base_interval + uniform(-jitter, +jitter)`.
    pub jitter: Duration,
    /// Cache entries at least this old are re-probed on the next refresh.
    pub staleness: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_interval: Duration::from_millis(40),
            jitter: Duration::from_millis(20),
            staleness: Duration::from_secs(30 * 60),
        }
    }
}
