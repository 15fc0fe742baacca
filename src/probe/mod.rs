//! Probe module for device reachability checks.
//!
//! A probe answers one question about one address: is it reachable right now.
//! Retries and cadence belong to the monitor, not here.

mod ping;

pub use ping::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Definite answer from a probe that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable,
}

/// A reachability check against a single address.
///
/// Implementations must return within roughly `timeout`; the monitor enforces
/// the bound regardless.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError>;
}

/// ICMP echo prober, falling back to the system `ping` command.
#[derive(Debug, Default, Clone)]
pub struct PingProber;

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
        match run_ping_probe(address, timeout).await {
            Ok(_latency) => Ok(ProbeOutcome::Reachable),
            Err(ProbeError::Timeout(_)) => Ok(ProbeOutcome::Unreachable),
            Err(e) => Err(e),
        }
    }
}

/// Run any prober with a hard upper bound on how long it may take.
pub async fn probe_with_deadline(
    prober: &dyn Prober,
    address: &str,
    timeout: Duration,
) -> Result<ProbeOutcome, ProbeError> {
    match tokio::time::timeout(timeout, prober.probe(address, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted prober for deterministic tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// One scripted probe answer.
    #[derive(Debug, Clone, Copy)]
    pub enum Step {
        Up,
        Down,
        Fail,
        /// Never answers; only the deadline ends it.
        Hang,
        /// Answers `Up` after the given delay.
        SlowUp(Duration),
    }

    /// Replays per-address steps; the last step repeats once the script runs out.
    #[derive(Default)]
    pub struct ScriptedProber {
        scripts: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, address: &str, steps: &[Step]) {
            self.scripts
                .lock()
                .insert(address.to_string(), steps.iter().copied().collect());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn next_step(&self, address: &str) -> Step {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(address) {
                Some(steps) if steps.len() > 1 => steps.pop_front().unwrap_or(Step::Down),
                Some(steps) => steps.front().copied().unwrap_or(Step::Down),
                None => Step::Down,
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, address: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
            self.calls.lock().push(address.to_string());
            match self.next_step(address) {
                Step::Up => Ok(ProbeOutcome::Reachable),
                Step::Down => Ok(ProbeOutcome::Unreachable),
                Step::Fail => Err(ProbeError::Command("ping helper missing".to_string())),
                Step::Hang => {
                    tokio::time::sleep(timeout * 100).await;
                    Ok(ProbeOutcome::Reachable)
                }
                Step::SlowUp(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(ProbeOutcome::Reachable)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedProber, Step};
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_hanging_probe() {
        let prober = ScriptedProber::new();
        prober.script("10.0.0.9", &[Step::Hang]);

        let start = tokio::time::Instant::now();
        let result = probe_with_deadline(&prober, "10.0.0.9", Duration::from_secs(2)).await;

        assert!(matches!(result, Err(ProbeError::Timeout(_))));
        assert!(start.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_scripted_prober_repeats_last_step() {
        let prober = ScriptedProber::new();
        prober.script("a", &[Step::Down, Step::Up]);

        let timeout = Duration::from_secs(1);
        assert_eq!(prober.probe("a", timeout).await.unwrap(), ProbeOutcome::Unreachable);
        assert_eq!(prober.probe("a", timeout).await.unwrap(), ProbeOutcome::Reachable);
        assert_eq!(prober.probe("a", timeout).await.unwrap(), ProbeOutcome::Reachable);
        assert_eq!(prober.calls().len(), 3);
    }
}
