//! Heartbeat loop for reporting agent state to the authority.
//!
//! The first successful report carries `start_flag`; later reports omit it.
//! If the authority does not support state reporting the reporter stops for
//! good instead of failing on every interval.

use std::sync::Arc;
use std::time::Duration;

use dynroute_events::AgentStateReport;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{Authority, ClientError};

/// Result of a single report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Reported,
    Failed,
    /// Reporting is unsupported; the reporter has disabled itself.
    Disabled,
}

/// Periodically reports agent state.
pub struct HeartbeatReporter {
    authority: Arc<dyn Authority>,
    report: AgentStateReport,
    interval: Duration,
    consecutive_failures: u32,
    disabled: bool,
}

impl HeartbeatReporter {
    /// `report` is sent as given on the first call, so it should have
    /// `start_flag` set. A zero `interval` disables reporting.
    pub fn new(authority: Arc<dyn Authority>, report: AgentStateReport, interval: Duration) -> Self {
        Self {
            authority,
            report,
            interval,
            consecutive_failures: 0,
            disabled: interval.is_zero(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the next report will carry `start_flag`.
    pub fn start_pending(&self) -> bool {
        self.report.start_flag
    }

    /// Send one report.
    pub async fn report_once(&mut self) -> ReportOutcome {
        if self.disabled {
            return ReportOutcome::Disabled;
        }

        match self.authority.report_state(&self.report).await {
            Ok(ack) => {
                if self.report.start_flag {
                    info!(agent_id = %ack.agent_id, "Registered with authority");
                }
                if !ack.admin_state_up {
                    warn!(agent_id = %ack.agent_id, "Agent is administratively down");
                }
                self.report.start_flag = false;
                self.consecutive_failures = 0;
                debug!(agent_id = %ack.agent_id, "State report acknowledged");
                ReportOutcome::Reported
            }
            Err(ClientError::Unsupported(_)) => {
                warn!("Authority does not support state reports, disabling state reporting");
                self.disabled = true;
                ReportOutcome::Disabled
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures <= 3 {
                    warn!(
                        error = %e,
                        consecutive_failures = self.consecutive_failures,
                        "State report failed"
                    );
                } else {
                    error!(
                        error = %e,
                        consecutive_failures = self.consecutive_failures,
                        "State report failed repeatedly"
                    );
                }
                ReportOutcome::Failed
            }
        }
    }

    /// Report on every interval until shutdown or until reporting is
    /// found to be unsupported.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.disabled {
            info!("State reporting disabled");
            return;
        }

        info!(
            host = %self.report.host,
            interval_secs = self.interval.as_secs(),
            "Starting heartbeat loop"
        );

        let mut timer = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if self.report_once().await == ReportOutcome::Disabled {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Heartbeat loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
