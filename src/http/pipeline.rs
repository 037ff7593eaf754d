//! Response streaming pipeline.
//!
//! Consumes the forwarder's event stream, records every event and relays the
//! response to the client.
//!
//! ```text
//! AwaitingHead ──head──▶ HeadReceived ──chunked──▶ ChunkedStreaming ──▶ Completed | Failed
//!                                     └─otherwise─▶ Buffering ─────────▶ Completed | Failed
//! ```
//!
//! # Design Decisions
//! - Chunked responses run as two legs: an upstream task reading events and a
//!   client body stream, joined by a one-slot channel. The upstream task
//!   waits for the slot before reading the next part, so it never reads
//!   ahead of what the client accepted.
//! - The client body holds a drop guard on a shared cancellation token. When
//!   hyper drops the body (client gone), the upstream task stops reading and
//!   drops the upstream connection.
//! - Errors before any response byte become the request's failure outcome;
//!   errors after that terminate the client body with an error.

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::Response;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use crate::error::ProxyError;
use crate::http::forwarder::{ForwardError, ResponseHead, UpstreamEvent, UpstreamEvents};
use crate::http::response;
use crate::observability::content_log::ContentLogger;
use crate::observability::metrics;
use crate::recording::interaction::HeaderList;
use crate::recording::recorder::InteractionRecorder;
use crate::recording::InteractionSink;

/// How the body is relayed, decided from the upstream head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// Relay each upstream part as its own write.
    Chunked,
    /// Collect the whole body, then write it once.
    Buffered,
}

impl TransferStrategy {
    pub fn for_head(head: &ResponseHead) -> Self {
        let chunked = head
            .headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            TransferStrategy::Chunked
        } else {
            TransferStrategy::Buffered
        }
    }
}

/// Drives one upstream exchange into a client response.
pub struct ResponsePipeline {
    recorder: InteractionRecorder,
    content_log: ContentLogger,
    sink: Arc<dyn InteractionSink>,
    request_id: String,
}

impl ResponsePipeline {
    pub fn new(recorder: InteractionRecorder, content_log: ContentLogger, sink: Arc<dyn InteractionSink>) -> Self {
        Self {
            recorder,
            content_log,
            sink,
            request_id: "unknown".to_string(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Wait for the upstream head, then relay the body with the strategy
    /// the head calls for.
    pub async fn run(self, mut events: UpstreamEvents) -> Result<Response, ProxyError> {
        let head = match events.next().await {
            Some(UpstreamEvent::Head(head)) => head,
            Some(UpstreamEvent::Error(e)) => {
                metrics::record_upstream_error("connect");
                return Err(ProxyError::UpstreamUnavailable(e));
            }
            Some(other) => {
                tracing::warn!(request_id = %self.request_id, event = ?other, "Upstream event before head");
                return Err(ProxyError::UpstreamUnavailable(ForwardError::MissingHead));
            }
            None => return Err(ProxyError::UpstreamUnavailable(ForwardError::MissingHead)),
        };

        self.recorder
            .record_head(head.status, HeaderList::from_header_map(&head.headers), head.version)?;
        self.content_log.response_started(head.status);

        let strategy = TransferStrategy::for_head(&head);
        tracing::debug!(
            request_id = %self.request_id,
            status = %head.status,
            strategy = ?strategy,
            "Upstream head received"
        );

        match strategy {
            TransferStrategy::Buffered => self.buffer(head, events).await,
            TransferStrategy::Chunked => Ok(self.stream(head, events)),
        }
    }

    async fn buffer(mut self, head: ResponseHead, mut events: UpstreamEvents) -> Result<Response, ProxyError> {
        let capacity = head
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0)
            .min(16 * 1024 * 1024);
        let mut body = Vec::with_capacity(capacity);

        loop {
            match events.next().await {
                Some(UpstreamEvent::BodyPart(bytes)) => {
                    self.recorder.record_body_chunk(bytes.clone())?;
                    metrics::record_body_chunk(bytes.len());
                    body.extend_from_slice(&bytes);
                }
                Some(UpstreamEvent::Complete) => break,
                Some(UpstreamEvent::Error(e)) => {
                    // Nothing has been written to the client yet.
                    metrics::record_upstream_error("stream");
                    tracing::warn!(request_id = %self.request_id, error = %e, "Upstream failed while buffering");
                    return Err(ProxyError::UpstreamUnavailable(e));
                }
                Some(UpstreamEvent::Head(_)) => {
                    tracing::warn!(request_id = %self.request_id, "Ignoring repeated upstream head");
                }
                None => return Err(ProxyError::UpstreamUnavailable(ForwardError::Truncated)),
            }
        }

        let sealed = self.recorder.record_completion()?;
        self.content_log.observe_full_body(&body);
        self.content_log.finish(head.status);
        self.sink.interaction_sealed(sealed);

        Ok(response::relay(head.status, &head.headers, Body::from(body)))
    }

    fn stream(self, head: ResponseHead, events: UpstreamEvents) -> Response {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let client_leg = ClientLeg {
            chunks: ReceiverStream::new(rx),
            _cancel_upstream: cancel.clone().drop_guard(),
        };

        let span = tracing::debug_span!("upstream", request_id = %self.request_id);
        let status = head.status;
        tokio::spawn(self.pump(status, events, tx, cancel).instrument(span));

        response::relay(head.status, &head.headers, Body::from_stream(client_leg))
    }

    /// Upstream leg: read, record, hand over; one part at a time.
    async fn pump(
        mut self,
        status: axum::http::StatusCode,
        mut events: UpstreamEvents,
        tx: mpsc::Sender<Result<Bytes, ForwardError>>,
        cancel: CancellationToken,
    ) {
        let mut relayed = 0usize;
        loop {
            // The slot frees up once the client leg took the previous part.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.client_gone(relayed),
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return self.client_gone(relayed),
                },
            };

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.client_gone(relayed),
                event = events.next() => event,
            };

            match event {
                Some(UpstreamEvent::BodyPart(bytes)) => {
                    if let Err(e) = self.recorder.record_body_chunk(bytes.clone()) {
                        tracing::warn!(error = %e, "Failed to record body chunk");
                    }
                    self.content_log.observe_chunk(&bytes);
                    metrics::record_body_chunk(bytes.len());
                    relayed += 1;
                    permit.send(Ok(bytes));
                }
                Some(UpstreamEvent::Complete) => {
                    drop(permit);
                    match self.recorder.record_completion() {
                        Ok(sealed) => {
                            self.content_log.finish(status);
                            self.sink.interaction_sealed(sealed);
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to seal interaction"),
                    }
                    tracing::debug!(chunks = relayed, "Upstream stream completed");
                    // Dropping `tx` ends the client body.
                    return;
                }
                Some(UpstreamEvent::Error(e)) => {
                    metrics::record_upstream_error("stream");
                    tracing::warn!(error = %e, chunks = relayed, "Upstream failed mid-stream; aborting client response");
                    permit.send(Err(e));
                    return;
                }
                Some(UpstreamEvent::Head(_)) => {
                    tracing::warn!("Ignoring repeated upstream head");
                }
                None => {
                    permit.send(Err(ForwardError::Truncated));
                    return;
                }
            }
        }
    }

    fn client_gone(&self, relayed: usize) {
        tracing::debug!(chunks = relayed, "Client disconnected; cancelling upstream");
    }
}

/// Client leg of a chunked response. Dropping it cancels the upstream leg.
struct ClientLeg {
    chunks: ReceiverStream<Result<Bytes, ForwardError>>,
    _cancel_upstream: DropGuard,
}

impl Stream for ClientLeg {
    type Item = Result<Bytes, ForwardError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.chunks).poll_next(cx)
    }
}
