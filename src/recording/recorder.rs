//! Interaction recorder.
//!
//! A cloneable handle over a mutex-guarded [`Interaction`]. All mutation
//! goes through `record_head`, `record_body_chunk` and `record_completion`;
//! the lock serializes them and each timestamp is read while holding it, so
//! recorded chunk order always matches call order.

use axum::body::Bytes;
use axum::http::{Method, StatusCode, Version};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::recording::clock::Clock;
use crate::recording::interaction::{HeaderList, Interaction, RecordedRequest, RecordedResponse};

/// Recorder misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("response head was already recorded")]
    HeadAlreadyRecorded,

    #[error("response head has not been recorded yet")]
    HeadNotRecorded,

    #[error("interaction is sealed")]
    Sealed,

    #[error("recorder state poisoned by a panicking writer")]
    Poisoned,
}

struct RecorderState {
    interaction: Interaction,
    sealed: Option<Arc<Interaction>>,
}

/// Accumulates one interaction from upstream head/body/completion events.
#[derive(Clone)]
pub struct InteractionRecorder {
    clock: Clock,
    state: Arc<Mutex<RecorderState>>,
}

impl InteractionRecorder {
    /// Start recording a request. The request start is the clock epoch.
    pub fn new(url: impl Into<String>, method: Method, headers: HeaderList, body: Option<Bytes>) -> Self {
        let clock = Clock::start();
        let request = RecordedRequest {
            url: url.into(),
            method,
            headers,
            body,
            start_time: clock.now(),
        };
        Self {
            clock,
            state: Arc::new(Mutex::new(RecorderState {
                interaction: Interaction::new(request),
                sealed: None,
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RecorderState>, RecordError> {
        self.state.lock().map_err(|_| RecordError::Poisoned)
    }

    /// Record the upstream response head. Callable once.
    pub fn record_head(&self, status: StatusCode, headers: HeaderList, version: Version) -> Result<(), RecordError> {
        let mut state = self.lock()?;
        if state.interaction.response.is_some() {
            return Err(RecordError::HeadAlreadyRecorded);
        }
        let now = self.clock.now();
        state.interaction.response = Some(RecordedResponse::new(status, headers, version, now));
        Ok(())
    }

    /// Append a body chunk stamped with the current time.
    pub fn record_body_chunk(&self, bytes: Bytes) -> Result<(), RecordError> {
        let mut state = self.lock()?;
        let now = self.clock.now();
        let response = state
            .interaction
            .response
            .as_mut()
            .ok_or(RecordError::HeadNotRecorded)?;
        if response.is_sealed() {
            return Err(RecordError::Sealed);
        }
        response.append(bytes, now);
        Ok(())
    }

    /// Set the end time and seal the interaction. Callable once; returns
    /// the immutable, shareable result.
    pub fn record_completion(&self) -> Result<Arc<Interaction>, RecordError> {
        let mut state = self.lock()?;
        let now = self.clock.now();
        let response = state
            .interaction
            .response
            .as_mut()
            .ok_or(RecordError::HeadNotRecorded)?;
        if response.is_sealed() {
            return Err(RecordError::Sealed);
        }
        response.seal(now);
        let sealed = Arc::new(state.interaction.clone());
        state.sealed = Some(Arc::clone(&sealed));
        Ok(sealed)
    }

    /// Current state of the interaction, sealed or not.
    pub fn snapshot(&self) -> Result<Interaction, RecordError> {
        Ok(self.lock()?.interaction.clone())
    }

    /// The sealed interaction, once completion has been recorded.
    pub fn sealed(&self) -> Option<Arc<Interaction>> {
        self.lock().ok().and_then(|state| state.sealed.clone())
    }

    /// Number of body chunks recorded so far.
    pub fn chunk_count(&self) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.interaction.response.as_ref().map(|r| r.body_chunks.len()))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for InteractionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionRecorder")
            .field("chunks", &self.chunk_count())
            .field("sealed", &self.sealed().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::clock::Timestamp;
    use std::time::Duration;

    fn recorder() -> InteractionRecorder {
        InteractionRecorder::new(
            "http://localhost:11434/api/chat",
            Method::POST,
            HeaderList::new(),
            Some(Bytes::from_static(b"{\"model\":\"llama3\"}")),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn records_wire_timing() {
        let rec = recorder();
        tokio::time::advance(Duration::from_millis(10)).await;
        rec.record_head(StatusCode::OK, HeaderList::new(), Version::HTTP_11).unwrap();

        for (delay, part) in [(40, "a"), (70, "b"), (5, "c")] {
            tokio::time::advance(Duration::from_millis(delay)).await;
            rec.record_body_chunk(Bytes::from(part)).unwrap();
        }
        tokio::time::advance(Duration::from_millis(5)).await;
        let sealed = rec.record_completion().unwrap();

        let response = sealed.response.as_ref().unwrap();
        assert_eq!(sealed.request.start_time, Timestamp::ZERO);
        assert_eq!(response.header_arrival.offset(), Duration::from_millis(10));
        let arrivals: Vec<_> = response.body_chunks.iter().map(|c| c.arrival.offset().as_millis()).collect();
        assert_eq!(arrivals, vec![50, 120, 125]);
        assert_eq!(response.end_time.unwrap().offset(), Duration::from_millis(130));
        assert!(sealed.timing_is_consistent());
    }

    #[test]
    fn head_is_recorded_once() {
        let rec = recorder();
        rec.record_head(StatusCode::OK, HeaderList::new(), Version::HTTP_11).unwrap();
        assert_eq!(
            rec.record_head(StatusCode::OK, HeaderList::new(), Version::HTTP_11),
            Err(RecordError::HeadAlreadyRecorded)
        );
    }

    #[test]
    fn chunk_before_head_is_rejected() {
        let rec = recorder();
        assert_eq!(
            rec.record_body_chunk(Bytes::from_static(b"x")),
            Err(RecordError::HeadNotRecorded)
        );
        assert_eq!(rec.record_completion().unwrap_err(), RecordError::HeadNotRecorded);
    }

    #[test]
    fn nothing_mutates_after_seal() {
        let rec = recorder();
        rec.record_head(StatusCode::OK, HeaderList::new(), Version::HTTP_11).unwrap();
        rec.record_body_chunk(Bytes::from_static(b"x")).unwrap();
        let sealed = rec.record_completion().unwrap();

        assert_eq!(rec.record_body_chunk(Bytes::from_static(b"y")), Err(RecordError::Sealed));
        assert_eq!(rec.record_completion().unwrap_err(), RecordError::Sealed);
        assert_eq!(rec.snapshot().unwrap(), *sealed);
        assert!(Arc::ptr_eq(&rec.sealed().unwrap(), &sealed));
    }

    #[test]
    fn snapshot_before_completion_is_unsealed() {
        let rec = recorder();
        rec.record_head(StatusCode::OK, HeaderList::new(), Version::HTTP_11).unwrap();
        let snapshot = rec.snapshot().unwrap();
        assert!(!snapshot.is_sealed());
        assert!(rec.sealed().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_keep_chunks_ordered_by_time() {
        let rec = recorder();
        rec.record_head(StatusCode::OK, HeaderList::new(), Version::HTTP_11).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let rec = rec.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    rec.record_body_chunk(Bytes::from(format!("{i}-{j}"))).unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let sealed = rec.record_completion().unwrap();
        assert_eq!(sealed.response.as_ref().unwrap().body_chunks.len(), 400);
        assert!(sealed.timing_is_consistent());
    }
}
