use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{IntegrityContext, IntegrityNotice};
use crate::session::{TerminationOutcome, TerminationReason};

const WARNING_THRESHOLD_SECS: u64 = 600;
const DANGER_THRESHOLD_SECS: u64 = 300;

/// Display-only urgency of the remaining time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Normal,
    Warning,
    Danger,
}

pub fn severity(seconds_remaining: u64) -> Severity {
    if seconds_remaining <= DANGER_THRESHOLD_SECS {
        Severity::Danger
    } else if seconds_remaining <= WARNING_THRESHOLD_SECS {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

pub struct Countdown {
    ctx: IntegrityContext,
    remaining: u64,
    severity: Severity,
}

impl Countdown {
    pub fn new(ctx: IntegrityContext, duration_minutes: u32) -> Self {
        Self::from_seconds(ctx, u64::from(duration_minutes) * 60)
    }

    pub fn from_seconds(ctx: IntegrityContext, seconds: u64) -> Self {
        let severity = severity(seconds);
        ctx.update(|state| {
            state.seconds_remaining = Some(seconds);
            state.severity = severity;
        });
        Self {
            ctx,
            remaining: seconds,
            severity,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// One second elapsed. Returns the termination outcome once time is up.
    pub async fn tick(&mut self) -> Option<TerminationOutcome> {
        self.remaining = self.remaining.saturating_sub(1);

        let severity = severity(self.remaining);
        let remaining = self.remaining;
        self.ctx.update(|state| {
            state.seconds_remaining = Some(remaining);
            state.severity = severity;
        });

        if severity != self.severity {
            tracing::debug!(seconds_remaining = remaining, ?severity, "Countdown severity changed");
            self.severity = severity;
            self.ctx.notify(IntegrityNotice::SeverityChanged(severity));
        }

        if self.remaining > 0 {
            return None;
        }

        tracing::info!("Exam time expired");
        Some(
            self.ctx
                .terminate(
                    TerminationReason::TimeUp,
                    "Session terminated due to time expiration".to_string(),
                    1,
                )
                .await,
        )
    }

    /// Ticks once a second until time runs out or another trigger ends the
    /// session first.
    pub async fn run(mut self) -> Option<TerminationOutcome> {
        let period = Duration::from_secs(1);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.remaining == 0 {
            return Some(
                self.ctx
                    .terminate(
                        TerminationReason::TimeUp,
                        "Session terminated due to time expiration".to_string(),
                        1,
                    )
                    .await,
            );
        }

        loop {
            ticker.tick().await;
            if self.ctx.is_terminated() {
                tracing::debug!("Session ended elsewhere, stopping countdown");
                return None;
            }
            if let Some(outcome) = self.tick().await {
                return Some(outcome);
            }
        }
    }
}
