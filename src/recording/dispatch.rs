//! Side activities for sealed interactions.
//!
//! # Responsibilities
//! - Persist each sealed interaction when recording to disk is enabled
//! - Replay it straight away for verification when asked to
//!
//! Both run on their own tasks. Failures are logged and counted, never
//! reported to the request that produced the interaction.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RecordingConfig;
use crate::observability::metrics;
use crate::recording::interaction::Interaction;
use crate::recording::replay::{Replay, ReplayError, SpeedFactor};
use crate::recording::store::RecordingStore;
use crate::recording::InteractionSink;

/// Outcome of replaying an interaction against its own recording.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub chunks: usize,
    pub bytes: usize,
    /// Replayed body equals the recorded body.
    pub matched: bool,
    /// Sum of the scheduled delays.
    pub expected: Duration,
    pub elapsed: Duration,
}

/// Replay `interaction` at `speed` and compare the output with the recording.
pub async fn verify_replay(interaction: Arc<Interaction>, speed: SpeedFactor) -> Result<VerificationReport, ReplayError> {
    let replay = Replay::new(Arc::clone(&interaction), speed)?;
    let expected = replay.total_duration();
    let recorded = interaction
        .response
        .as_ref()
        .map(|r| r.body())
        .unwrap_or_default();

    let start = Instant::now();
    let mut replayed = Vec::with_capacity(recorded.len());
    let mut chunks = 0;
    let mut stream = replay.chunks();
    while let Some(bytes) = stream.next().await {
        chunks += 1;
        replayed.extend_from_slice(&bytes);
    }

    Ok(VerificationReport {
        chunks,
        bytes: replayed.len(),
        matched: replayed == recorded,
        expected,
        elapsed: start.elapsed(),
    })
}

/// Routes sealed interactions to the store and the verifier.
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatcher {
    store: Option<RecordingStore>,
    verify_speed: Option<SpeedFactor>,
}

impl RecordingDispatcher {
    pub fn new(store: Option<RecordingStore>, verify_speed: Option<SpeedFactor>) -> Self {
        Self { store, verify_speed }
    }

    pub fn from_config(config: &RecordingConfig) -> Result<Self, ReplayError> {
        let store = config.persist.then(|| {
            let directory = config
                .directory
                .clone()
                .unwrap_or_else(RecordingStore::default_directory);
            RecordingStore::new(directory)
        });
        let verify_speed = if config.replay_verify {
            Some(SpeedFactor::new(config.replay_speed)?)
        } else {
            None
        };
        Ok(Self::new(store, verify_speed))
    }

    pub fn store(&self) -> Option<&RecordingStore> {
        self.store.as_ref()
    }

    pub fn verify_speed(&self) -> Option<SpeedFactor> {
        self.verify_speed
    }

    pub fn is_active(&self) -> bool {
        self.store.is_some() || self.verify_speed.is_some()
    }
}

impl InteractionSink for RecordingDispatcher {
    fn interaction_sealed(&self, interaction: Arc<Interaction>) {
        if !self.is_active() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available; dropping sealed interaction");
            return;
        };

        if let Some(store) = self.store.clone() {
            let interaction = Arc::clone(&interaction);
            runtime.spawn(async move {
                match store.save(&interaction).await {
                    Ok(path) => {
                        metrics::record_persisted(true);
                        tracing::info!(path = %path.display(), url = %interaction.request.url, "Recording saved");
                    }
                    Err(e) => {
                        metrics::record_persisted(false);
                        tracing::warn!(error = %e, url = %interaction.request.url, "Failed to persist recording");
                    }
                }
            });
        }

        if let Some(speed) = self.verify_speed {
            runtime.spawn(async move {
                let url = interaction.request.url.clone();
                match verify_replay(interaction, speed).await {
                    Ok(report) => {
                        metrics::record_verification(report.matched);
                        if report.matched {
                            tracing::info!(
                                url = %url,
                                chunks = report.chunks,
                                bytes = report.bytes,
                                speed = speed.get(),
                                expected_ms = report.expected.as_millis() as u64,
                                elapsed_ms = report.elapsed.as_millis() as u64,
                                "Replay verified"
                            );
                        } else {
                            tracing::warn!(url = %url, chunks = report.chunks, "Replay diverged from recording");
                        }
                    }
                    Err(e) => tracing::warn!(url = %url, error = %e, "Replay verification rejected"),
                }
            });
        }
    }
}
