//! Restart supervision
//!
//! Decides what happens when a service container exits. The compose
//! `restart` key gives the policy; an optional [`Backoff`] spaces out
//! repeated restarts. Without a backoff, restarts are immediate and
//! unbounded for `always`, which is what docker compose does.

use crate::error::{BerthError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Container restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    No,
    /// Restart on any exit
    Always,
    /// Restart on non-zero exit, optionally bounded
    OnFailure { max_retries: Option<u32> },
    /// Like `always`, but an explicitly stopped container stays down
    /// across daemon restarts
    UnlessStopped,
}

impl std::str::FromStr for RestartPolicy {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "no" | "\"no\"" | "none" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure { max_retries: None }),
            other => match other.strip_prefix("on-failure:") {
                Some(n) => n
                    .parse()
                    .map(|max| RestartPolicy::OnFailure {
                        max_retries: Some(max),
                    })
                    .map_err(|_| BerthError::InvalidRestartPolicy(other.to_string())),
                None => Err(BerthError::InvalidRestartPolicy(other.to_string())),
            },
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
            RestartPolicy::OnFailure { max_retries: None } => write!(f, "on-failure"),
            RestartPolicy::OnFailure {
                max_retries: Some(n),
            } => write!(f, "on-failure:{}", n),
        }
    }
}

impl RestartPolicy {
    /// Whether the policy restarts without any bound
    pub fn is_unbounded(&self) -> bool {
        matches!(
            self,
            RestartPolicy::Always
                | RestartPolicy::UnlessStopped
                | RestartPolicy::OnFailure { max_retries: None }
        )
    }
}

/// Exponential restart backoff
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first restart
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor per consecutive restart
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before restart number `attempt` (zero based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Outcome of a container exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after the given delay
    Restart { delay: Duration, attempt: u32 },
    /// Policy allows restarts but the retry budget is spent
    GiveUp,
    /// Policy does not restart in this case
    Leave,
}

/// Per-service restart accounting
#[derive(Debug, Default)]
pub struct RestartTracker {
    backoff: Option<Backoff>,
    attempts: HashMap<String, u32>,
}

impl RestartTracker {
    /// Tracker with immediate restarts
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that spaces restarts with `backoff`
    pub fn with_backoff(backoff: Backoff) -> Self {
        Self {
            backoff: Some(backoff),
            attempts: HashMap::new(),
        }
    }

    /// Decide what to do after `service` exited with `exit_code`
    pub fn on_exit(
        &mut self,
        service: &str,
        policy: Option<RestartPolicy>,
        exit_code: i32,
        stopped_by_user: bool,
    ) -> RestartDecision {
        let policy = policy.unwrap_or(RestartPolicy::No);
        let wants_restart = match policy {
            RestartPolicy::No => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure { .. } => exit_code != 0,
        };

        // An explicit stop is never undone by the policy
        if stopped_by_user || !wants_restart {
            return RestartDecision::Leave;
        }

        let attempt = self.attempts.get(service).copied().unwrap_or(0);
        if let RestartPolicy::OnFailure {
            max_retries: Some(max),
        } = policy
        {
            if attempt >= max {
                tracing::warn!(
                    "Service {} exceeded {} restart attempts, giving up",
                    service,
                    max
                );
                return RestartDecision::GiveUp;
            }
        }

        self.attempts.insert(service.to_string(), attempt + 1);
        let delay = self
            .backoff
            .map(|b| b.delay(attempt))
            .unwrap_or(Duration::ZERO);

        RestartDecision::Restart { delay, attempt: attempt + 1 }
    }

    /// Forget restart history, e.g. once a service has stayed up
    pub fn reset(&mut self, service: &str) {
        self.attempts.remove(service);
    }

    /// Restarts issued so far for `service`
    pub fn attempts(&self, service: &str) -> u32 {
        self.attempts.get(service).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policies() {
        assert_eq!("always".parse::<RestartPolicy>().unwrap(), RestartPolicy::Always);
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure { max_retries: Some(3) }
        );
        assert!("sometimes".parse::<RestartPolicy>().is_err());
        assert!("on-failure:x".parse::<RestartPolicy>().is_err());
        assert_eq!(RestartPolicy::OnFailure { max_retries: Some(3) }.to_string(), "on-failure:3");
    }

    #[test]
    fn test_always_restarts_unbounded_and_immediately() {
        let mut tracker = RestartTracker::new();
        for i in 1..=50 {
            let decision = tracker.on_exit("redis", Some(RestartPolicy::Always), 137, false);
            assert_eq!(
                decision,
                RestartDecision::Restart {
                    delay: Duration::ZERO,
                    attempt: i
                }
            );
        }
    }

    #[test]
    fn test_no_policy_leaves_container_down() {
        let mut tracker = RestartTracker::new();
        assert_eq!(tracker.on_exit("app", None, 1, false), RestartDecision::Leave);
    }

    #[test]
    fn test_on_failure_bounded() {
        let mut tracker = RestartTracker::new();
        let policy = Some(RestartPolicy::OnFailure { max_retries: Some(2) });
        assert_eq!(tracker.on_exit("app", policy, 0, false), RestartDecision::Leave);
        assert!(matches!(tracker.on_exit("app", policy, 1, false), RestartDecision::Restart { .. }));
        assert!(matches!(tracker.on_exit("app", policy, 1, false), RestartDecision::Restart { .. }));
        assert_eq!(tracker.on_exit("app", policy, 1, false), RestartDecision::GiveUp);
        tracker.reset("app");
        assert_eq!(tracker.attempts("app"), 0);
    }

    #[test]
    fn test_unless_stopped_respects_user_stop() {
        let mut tracker = RestartTracker::new();
        let policy = Some(RestartPolicy::UnlessStopped);
        assert_eq!(tracker.on_exit("db", policy, 0, true), RestartDecision::Leave);
        assert!(matches!(tracker.on_exit("db", policy, 0, false), RestartDecision::Restart { .. }));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(10), Duration::from_secs(10));

        let mut tracker = RestartTracker::with_backoff(backoff);
        let first = tracker.on_exit("redis", Some(RestartPolicy::Always), 1, false);
        let second = tracker.on_exit("redis", Some(RestartPolicy::Always), 1, false);
        assert_eq!(first, RestartDecision::Restart { delay: Duration::from_secs(1), attempt: 1 });
        assert_eq!(second, RestartDecision::Restart { delay: Duration::from_secs(2), attempt: 2 });
    }
}
