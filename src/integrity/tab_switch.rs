use futures::{Stream, StreamExt};
use std::time::Duration;

use super::{IntegrityContext, IntegrityNotice};
use crate::config::IntegrityConfig;
use crate::session::{TerminationOutcome, TerminationReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Counts transitions to hidden. Below the limit each one shows a
/// transient warning; reaching the limit ends the session.
pub struct TabSwitchTrigger {
    ctx: IntegrityContext,
    limit: u32,
    display_for: Duration,
    visibility: Visibility,
}

impl TabSwitchTrigger {
    pub fn new(ctx: IntegrityContext, config: &IntegrityConfig) -> Self {
        Self {
            ctx,
            limit: config.tab_switch_limit.max(1),
            display_for: config.warning_display,
            visibility: Visibility::Visible,
        }
    }

    pub async fn on_visibility(&mut self, visibility: Visibility) -> Option<TerminationOutcome> {
        let previous = std::mem::replace(&mut self.visibility, visibility);
        if visibility != Visibility::Hidden || previous == Visibility::Hidden {
            return None;
        }
        if self.ctx.is_terminated() {
            return None;
        }

        let count = self.ctx.update(|state| state.tab_switches += 1).tab_switches;
        tracing::info!(count, limit = self.limit, "Tab switch detected");

        if count < self.limit {
            self.ctx.notify(IntegrityNotice::TabSwitchWarning {
                count,
                remaining: self.limit - count,
                display_for: self.display_for,
            });
            return None;
        }
        if count > self.limit {
            return None;
        }

        let message = format!("Session terminated due to {} tab switch violations", count);
        Some(self.ctx.terminate(TerminationReason::TabSwitch, message, count).await)
    }

    pub async fn run<S>(mut self, events: S)
    where
        S: Stream<Item = Visibility> + Send,
    {
        futures::pin_mut!(events);
        while let Some(visibility) = events.next().await {
            if self.on_visibility(visibility).await.is_some() {
                break;
            }
        }
        tracing::debug!("Tab switch trigger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::testing::context;

    #[tokio::test]
    async fn test_third_switch_terminates_once() {
        let (ctx, terminator, mut notices) = context();
        let mut trigger = TabSwitchTrigger::new(ctx.clone(), &IntegrityConfig::default());

        for _ in 0..2 {
            assert!(trigger.on_visibility(Visibility::Hidden).await.is_none());
            trigger.on_visibility(Visibility::Visible).await;
        }
        assert!(terminator.calls().is_empty());

        let outcome = trigger.on_visibility(Visibility::Hidden).await;
        assert!(matches!(outcome, Some(TerminationOutcome::Terminated { .. })));

        trigger.on_visibility(Visibility::Visible).await;
        assert!(trigger.on_visibility(Visibility::Hidden).await.is_none());

        let calls = terminator.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, TerminationReason::TabSwitch);
        assert_eq!(calls[0].2, 3);
        assert_eq!(ctx.state().terminated, Some(TerminationReason::TabSwitch));

        let first = notices.try_recv().unwrap();
        assert_eq!(
            first,
            IntegrityNotice::TabSwitchWarning {
                count: 1,
                remaining: 2,
                display_for: Duration::from_secs(3),
            }
        );
    }

    #[tokio::test]
    async fn test_repeated_hidden_without_return_counts_once() {
        let (ctx, _terminator, _notices) = context();
        let mut trigger = TabSwitchTrigger::new(ctx.clone(), &IntegrityConfig::default());

        trigger.on_visibility(Visibility::Hidden).await;
        trigger.on_visibility(Visibility::Hidden).await;
        assert_eq!(ctx.state().tab_switches, 1);
    }

    #[tokio::test]
    async fn test_run_consumes_visibility_stream() {
        let (ctx, terminator, _notices) = context();
        let trigger = TabSwitchTrigger::new(ctx, &IntegrityConfig::default());

        let events = futures::stream::iter(vec![
            Visibility::Hidden,
            Visibility::Visible,
            Visibility::Hidden,
            Visibility::Visible,
            Visibility::Hidden,
            Visibility::Visible,
            Visibility::Hidden,
        ]);
        trigger.run(events).await;
        assert_eq!(terminator.calls().len(), 1);
    }
}
