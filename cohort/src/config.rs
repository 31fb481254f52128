//! Runtime-configurable timeouts for cohort sessions.
//!
//! All values have defaults. Override via environment variables (prefixed
//! `COHORT_`) or by constructing a custom `CommsConfig`.

use std::net::IpAddr;
use std::time::Duration;

/// Timeouts and binding parameters shared by the controller and workers.
#[derive(Debug, Clone)]
pub struct CommsConfig {
    /// Deadline for one round of controller tasks (bootstrap, context
    /// construction, teardown, dispatch) to complete on every worker.
    pub task_timeout: Duration,

    /// Timeout for clique rendezvous and each receive inside a collective.
    pub collective_timeout: Duration,

    /// Timeout for connecting to and receiving from a point-to-point peer.
    pub p2p_timeout: Duration,

    /// Address the point-to-point transport listeners bind to.
    pub transport_bind: IpAddr,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(30),
            collective_timeout: Duration::from_secs(10),
            p2p_timeout: Duration::from_secs(10),
            transport_bind: IpAddr::from([127, 0, 0, 1]),
        }
    }
}

impl CommsConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `COHORT_TASK_TIMEOUT_MS`
    /// - `COHORT_COLLECTIVE_TIMEOUT_MS`
    /// - `COHORT_P2P_TIMEOUT_MS`
    /// - `COHORT_TRANSPORT_BIND`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = env_parse::<u64>("COHORT_TASK_TIMEOUT_MS") {
            cfg.task_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("COHORT_COLLECTIVE_TIMEOUT_MS") {
            cfg.collective_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("COHORT_P2P_TIMEOUT_MS") {
            cfg.p2p_timeout = Duration::from_millis(ms);
        }
        if let Some(ip) = env_parse::<IpAddr>("COHORT_TRANSPORT_BIND") {
            cfg.transport_bind = ip;
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let v = std::env::var(key).ok()?;
    match v.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("ignoring unparsable {key}={v}");
            None
        }
    }
}
