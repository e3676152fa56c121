//! Face-presence sampling.
//!
//! The classifier is an opaque capability: something that looks at the
//! current video frame and reports how many faces it sees. The sampler
//! turns those readings into rate-limited warnings and ends the session
//! once enough warnings have piled up.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::{IntegrityContext, IntegrityNotice};
use crate::config::IntegrityConfig;
use crate::error::Result;
use crate::protocol::now_millis;
use crate::session::{TerminationOutcome, TerminationReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceClassification {
    Zero,
    One,
    Multiple,
}

impl FaceClassification {
    pub fn from_count(faces: usize) -> Self {
        match faces {
            0 => FaceClassification::Zero,
            1 => FaceClassification::One,
            _ => FaceClassification::Multiple,
        }
    }

    fn violation(self) -> Option<(TerminationReason, &'static str)> {
        match self {
            FaceClassification::Zero => Some((TerminationReason::NoFace, "No face detected in the frame")),
            FaceClassification::Multiple => {
                Some((TerminationReason::MultipleFaces, "Multiple faces detected in the frame"))
            }
            FaceClassification::One => None,
        }
    }
}

#[async_trait]
pub trait FaceClassifier: Send + Sync {
    async fn classify(&self) -> Result<FaceClassification>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceWarning {
    pub reason: TerminationReason,
    pub count: u32,
    pub message: String,
}

pub struct FaceDetectionSampler {
    ctx: IntegrityContext,
    interval: Duration,
    cooldown: Duration,
    threshold: u32,
    count: u32,
    last_warning: Option<Instant>,
}

impl FaceDetectionSampler {
    pub fn new(ctx: IntegrityContext, config: &IntegrityConfig) -> Self {
        Self {
            ctx,
            interval: config.face_sample_interval,
            cooldown: config.face_warning_cooldown,
            threshold: config.face_warning_threshold.max(1),
            count: 0,
            last_warning: None,
        }
    }

    pub fn warning_count(&self) -> u32 {
        self.count
    }

    /// Both kinds of violation share one counter and one cooldown window.
    pub fn observe(&mut self, classification: FaceClassification, now: Instant) -> Option<FaceWarning> {
        let (reason, message) = classification.violation()?;

        if let Some(last) = self.last_warning {
            if now.duration_since(last) <= self.cooldown {
                return None;
            }
        }

        self.count += 1;
        self.last_warning = Some(now);
        let count = self.count;
        let stamped = now_millis();
        self.ctx.update(|state| {
            state.face_warnings = count;
            state.last_face_warning_ms = Some(stamped);
        });

        tracing::info!(reason = %reason, count, threshold = self.threshold, "Face detection warning");

        let warning = FaceWarning {
            reason,
            count,
            message: message.to_string(),
        };
        self.ctx.notify(IntegrityNotice::FaceWarning(warning.clone()));
        Some(warning)
    }

    pub async fn record(&self, warning: &FaceWarning) -> Option<TerminationOutcome> {
        if warning.count < self.threshold || self.ctx.is_terminated() {
            return None;
        }
        Some(
            self.ctx
                .terminate(warning.reason, warning.message.clone(), warning.count)
                .await,
        )
    }

    pub async fn sample(&mut self, classification: FaceClassification, now: Instant) -> Option<TerminationOutcome> {
        let warning = self.observe(classification, now)?;
        self.record(&warning).await
    }

    pub async fn run(mut self, classifier: Arc<dyn FaceClassifier>) -> Option<TerminationOutcome> {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.ctx.is_terminated() {
                tracing::debug!("Session ended elsewhere, stopping face detection");
                return None;
            }

            let classification = match classifier.classify().await {
                Ok(classification) => classification,
                Err(e) => {
                    tracing::warn!(error = %e, "Face classification failed, skipping sample");
                    continue;
                }
            };

            if let Some(outcome) = self.sample(classification, Instant::now()).await {
                return Some(outcome);
            }
        }
    }
}
