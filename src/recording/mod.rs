//! Recording and replay subsystem.
//!
//! # Data Flow
//! ```text
//! pipeline events
//!     → recorder.rs (head / chunk / completion, one clock per interaction)
//!     → sealed Arc<Interaction>
//!     → dispatch.rs (InteractionSink)
//!         → store.rs (JSON file per interaction)
//!         → replay.rs (verification replay)
//!
//! replay-cli / replay server:
//!     store.rs (load) → replay.rs (paced chunk stream)
//! ```
//!
//! # Design Decisions
//! - Timestamps are monotonic offsets from request start; they are never
//!   compared across interactions and serialize as-is
//! - Sealed interactions are immutable and shared by `Arc`
//! - Persistence and verification are side activities; they never fail or
//!   delay the proxied request

pub mod clock;
pub mod dispatch;
pub mod interaction;
pub mod recorder;
pub mod replay;
pub mod store;

use std::sync::Arc;

pub use clock::{Clock, Timestamp};
pub use dispatch::RecordingDispatcher;
pub use interaction::{BodyChunk, HeaderList, Interaction, RecordedRequest, RecordedResponse};
pub use recorder::{InteractionRecorder, RecordError};
pub use replay::{Replay, ReplayError, SpeedFactor};
pub use store::{RecordingStore, StoreError};

/// Receives every interaction once it is sealed.
///
/// Called from the request path; implementations must return quickly and
/// push any slow work onto their own tasks.
pub trait InteractionSink: Send + Sync {
    fn interaction_sealed(&self, interaction: Arc<Interaction>);
}

/// Discards sealed interactions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl InteractionSink for DiscardSink {
    fn interaction_sealed(&self, _interaction: Arc<Interaction>) {}
}

impl InteractionSink for tokio::sync::mpsc::UnboundedSender<Arc<Interaction>> {
    fn interaction_sealed(&self, interaction: Arc<Interaction>) {
        let _ = self.send(interaction);
    }
}
