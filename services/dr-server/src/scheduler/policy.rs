//! Scheduling knobs and agent liveness.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default age after which an agent's heartbeat counts as missed.
pub const DEFAULT_AGENT_DOWN_TIME: Duration = Duration::from_secs(75);

#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    /// Heartbeats older than this mark the agent as down.
    pub agent_down_time: Duration,

    /// When false, sync requests only return work that is already bound.
    pub auto_schedule: bool,

    /// Upper bound on peers claimed by one auto-schedule pass.
    pub max_peers_per_pass: Option<usize>,

    /// When false, state reports are answered as unsupported.
    pub state_reporting: bool,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            agent_down_time: DEFAULT_AGENT_DOWN_TIME,
            auto_schedule: true,
            max_peers_per_pass: None,
            state_reporting: true,
        }
    }
}

impl SchedulerPolicy {
    pub fn is_agent_down(&self, heartbeat_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.agent_down_time) {
            Ok(down_time) => now.signed_duration_since(heartbeat_at) > down_time,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(74, false)]
    #[case(75, false)]
    #[case(76, true)]
    #[case(3600, true)]
    fn test_is_agent_down(#[case] age_secs: i64, #[case] down: bool) {
        let policy = SchedulerPolicy::default();
        let now = Utc::now();
        let heartbeat_at = now - chrono::Duration::seconds(age_secs);
        assert_eq!(policy.is_agent_down(heartbeat_at, now), down);
    }

    #[test]
    fn test_future_heartbeat_is_alive() {
        let policy = SchedulerPolicy::default();
        let now = Utc::now();
        assert!(!policy.is_agent_down(now + chrono::Duration::seconds(30), now));
    }
}
