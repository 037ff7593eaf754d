//! Replay engine.
//!
//! Turns a sealed [`Interaction`] back into a timed body stream. The first
//! chunk waits `(arrival[0] - header_arrival) / speed`, every following
//! chunk waits `(arrival[i] - arrival[i-1]) / speed`.
//!
//! # Design Decisions
//! - Replays never touch the source interaction; every `chunks()` call walks
//!   the same `Arc` snapshot independently.
//! - Streams are lazy. Dropping one mid-way drops the pending sleep, so no
//!   chunk is emitted after the consumer walks away.

use axum::body::Bytes;
use axum::http::{StatusCode, Version};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::recording::clock::Timestamp;
use crate::recording::interaction::{HeaderList, Interaction, RecordedResponse};

/// Replay configuration errors, raised before anything is emitted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    #[error("speed factor must be a positive finite number, got {0}")]
    InvalidSpeed(f64),

    #[error("interaction has no recorded response")]
    NoResponse,

    #[error("interaction is not sealed")]
    Unsealed,
}

/// Playback speed multiplier. `1.0` is real time, `2.0` twice as fast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedFactor(f64);

impl SpeedFactor {
    pub const REAL_TIME: SpeedFactor = SpeedFactor(1.0);

    pub fn new(factor: f64) -> Result<Self, ReplayError> {
        if factor.is_finite() && factor > 0.0 {
            Ok(Self(factor))
        } else {
            Err(ReplayError::InvalidSpeed(factor))
        }
    }

    pub fn get(&self) -> f64 {
        self.0
    }

    /// Scale a recorded delay for playback.
    pub fn scale(&self, recorded: Duration) -> Duration {
        let nanos = (recorded.as_nanos() as f64 / self.0).round();
        // `as` saturates on overflow.
        Duration::from_nanos(nanos as u64)
    }
}

impl Default for SpeedFactor {
    fn default() -> Self {
        Self::REAL_TIME
    }
}

/// Response metadata emitted ahead of the replayed body.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayHead {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub version: Version,
}

/// One paced chunk: wait `delay`, then emit `bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayStep {
    pub delay: Duration,
    pub bytes: Bytes,
}

/// A validated replay of one sealed interaction.
#[derive(Debug, Clone)]
pub struct Replay {
    interaction: Arc<Interaction>,
    response: Arc<RecordedResponse>,
    speed: SpeedFactor,
}

impl Replay {
    /// Validate `interaction` for playback at `speed`.
    pub fn new(interaction: Arc<Interaction>, speed: SpeedFactor) -> Result<Self, ReplayError> {
        let response = interaction.response.as_ref().ok_or(ReplayError::NoResponse)?;
        if !response.is_sealed() {
            return Err(ReplayError::Unsealed);
        }
        let response = Arc::new(response.clone());
        Ok(Self {
            interaction,
            response,
            speed,
        })
    }

    /// Convenience for a raw speed value from configuration or the CLI.
    pub fn with_speed(interaction: Arc<Interaction>, speed: f64) -> Result<Self, ReplayError> {
        Self::new(interaction, SpeedFactor::new(speed)?)
    }

    pub fn speed(&self) -> SpeedFactor {
        self.speed
    }

    pub fn interaction(&self) -> &Arc<Interaction> {
        &self.interaction
    }

    pub fn head(&self) -> ReplayHead {
        ReplayHead {
            status: self.response.status,
            headers: self.response.headers.clone(),
            version: self.response.version,
        }
    }

    /// The paced steps, computed eagerly.
    pub fn schedule(&self) -> Vec<ReplayStep> {
        let mut previous = self.response.header_arrival;
        self.response
            .body_chunks
            .iter()
            .map(|chunk| {
                let delay = self.speed.scale(chunk.arrival.since(previous));
                previous = chunk.arrival;
                ReplayStep {
                    delay,
                    bytes: chunk.bytes.clone(),
                }
            })
            .collect()
    }

    /// Sum of all scaled delays.
    pub fn total_duration(&self) -> Duration {
        self.schedule().iter().map(|s| s.delay).sum()
    }

    /// A fresh, lazily paced body stream.
    pub fn chunks(&self) -> BoxStream<'static, Bytes> {
        struct Cursor {
            response: Arc<RecordedResponse>,
            speed: SpeedFactor,
            next: usize,
            previous: Option<Timestamp>,
        }

        let cursor = Cursor {
            response: Arc::clone(&self.response),
            speed: self.speed,
            next: 0,
            previous: None,
        };

        stream::unfold(cursor, |mut cursor| async move {
            let chunk = cursor.response.body_chunks.get(cursor.next)?;
            let previous = cursor.previous.unwrap_or(cursor.response.header_arrival);
            let delay = cursor.speed.scale(chunk.arrival.since(previous));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let bytes = chunk.bytes.clone();
            cursor.previous = Some(chunk.arrival);
            cursor.next += 1;
            Some((bytes, cursor))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::interaction::RecordedRequest;
    use axum::http::Method;
    use tokio::time::Instant;

    fn ms(n: u64) -> Timestamp {
        Timestamp::from_offset(Duration::from_millis(n))
    }

    fn recorded(head: u64, arrivals: &[(u64, &'static str)], end: u64) -> Arc<Interaction> {
        let request = RecordedRequest {
            url: "http://localhost:11434/api/chat".into(),
            method: Method::POST,
            headers: HeaderList::new(),
            body: Some(Bytes::from_static(b"{\"model\":\"llama3\",\"stream\":true}")),
            start_time: Timestamp::ZERO,
        };
        let mut headers = HeaderList::new();
        headers.push("Transfer-Encoding", "chunked");
        let mut response = RecordedResponse::new(StatusCode::OK, headers, Version::HTTP_11, ms(head));
        for (at, part) in arrivals {
            response.append(Bytes::from(part.to_string()), ms(*at));
        }
        response.seal(ms(end));
        let mut interaction = Interaction::new(request);
        interaction.response = Some(response);
        Arc::new(interaction)
    }

    fn scenario() -> Arc<Interaction> {
        recorded(0, &[(50, "one"), (120, "two"), (125, "three")], 130)
    }

    #[test]
    fn rejects_non_positive_speed() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(SpeedFactor::new(bad), Err(ReplayError::InvalidSpeed(_))));
        }
        assert!(Replay::with_speed(scenario(), 0.0).is_err());
    }

    #[test]
    fn rejects_unsealed_interaction() {
        let mut interaction = (*scenario()).clone();
        interaction.response.as_mut().unwrap().end_time = None;
        assert_eq!(
            Replay::new(Arc::new(interaction), SpeedFactor::REAL_TIME).unwrap_err(),
            ReplayError::Unsealed
        );

        let mut interaction = (*scenario()).clone();
        interaction.response = None;
        assert_eq!(
            Replay::new(Arc::new(interaction), SpeedFactor::REAL_TIME).unwrap_err(),
            ReplayError::NoResponse
        );
    }

    #[test]
    fn schedule_scales_recorded_deltas() {
        let replay = Replay::with_speed(scenario(), 2.0).unwrap();
        let delays: Vec<_> = replay.schedule().into_iter().map(|s| s.delay).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_micros(25_000),
                Duration::from_micros(35_000),
                Duration::from_micros(2_500),
            ]
        );
        assert_eq!(replay.total_duration(), Duration::from_micros(62_500));

        let slow = Replay::with_speed(scenario(), 0.5).unwrap();
        assert_eq!(slow.total_duration(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn replay_reproduces_cadence_at_double_speed() {
        let replay = Replay::with_speed(scenario(), 2.0).unwrap();
        let start = Instant::now();
        let mut stream = replay.chunks();
        let mut seen = Vec::new();
        while let Some(bytes) = stream.next().await {
            seen.push((start.elapsed(), bytes));
        }

        let expected = [(25.0, "one"), (60.0, "two"), (62.5, "three")];
        assert_eq!(seen.len(), expected.len());
        for ((at, bytes), (want_ms, want)) in seen.iter().zip(expected) {
            assert_eq!(bytes, want.as_bytes());
            let diff = (at.as_secs_f64() * 1000.0 - want_ms).abs();
            assert!(diff <= 1.0, "chunk {want} at {at:?}, expected {want_ms}ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn real_time_replay_keeps_recorded_offsets() {
        let replay = Replay::new(scenario(), SpeedFactor::REAL_TIME).unwrap();
        let start = Instant::now();
        let mut stream = replay.chunks();
        let mut seen = Vec::new();
        while let Some(bytes) = stream.next().await {
            seen.push((start.elapsed(), bytes));
        }

        let expected = [(50.0, "one"), (120.0, "two"), (125.0, "three")];
        assert_eq!(seen.len(), expected.len());
        for ((at, bytes), (want_ms, want)) in seen.iter().zip(expected) {
            assert_eq!(bytes, want.as_bytes());
            let diff = (at.as_secs_f64() * 1000.0 - want_ms).abs();
            assert!(diff <= 1.0, "chunk {want} at {at:?}, expected {want_ms}ms");
        }
        assert_eq!(replay.total_duration(), Duration::from_millis(125));
    }

    #[tokio::test(start_paused = true)]
    async fn replay_is_restartable() {
        let replay = Replay::new(scenario(), SpeedFactor::REAL_TIME).unwrap();
        let first: Vec<Bytes> = replay.chunks().collect().await;
        let second: Vec<Bytes> = replay.chunks().collect().await;
        assert_eq!(first, second);
        assert_eq!(first.concat(), b"onetwothree".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_body_completes_immediately() {
        let replay = Replay::new(recorded(3, &[], 4), SpeedFactor::REAL_TIME).unwrap();
        assert_eq!(replay.head().status, StatusCode::OK);
        let start = Instant::now();
        assert!(replay.chunks().next().await.is_none());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_stream_emits_nothing_more() {
        let replay = Replay::new(scenario(), SpeedFactor::REAL_TIME).unwrap();
        let taken: Vec<Bytes> = replay.chunks().take(1).collect().await;
        assert_eq!(taken, vec![Bytes::from_static(b"one")]);

        let mut stream = replay.chunks();
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"one"));
        let pending = tokio::time::timeout(Duration::from_millis(10), stream.next()).await;
        assert!(pending.is_err(), "second chunk is due 70ms later");
        drop(stream);
        assert_eq!(Arc::strong_count(&replay.response), 1);
    }
}
