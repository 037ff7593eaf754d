//! The proxy service: one object per process, shared by every handler.
//!
//! # Responsibilities
//! - Own the forwarder (and with it the upstream connection pool)
//! - Own the sink that receives sealed interactions
//! - Turn one inbound request into one recorded, relayed exchange
//!
//! # Design Decisions
//! - Built explicitly in `main` and handed to axum as state
//! - The recorded request carries the headers actually sent upstream

use axum::body::Body;
use axum::http::{Request, Uri};
use axum::response::Response;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::{ConfigError, ProxyConfig};
use crate::config::validation::ValidationError;
use crate::error::ProxyError;
use crate::http::forwarder::Forwarder;
use crate::http::pipeline::ResponsePipeline;
use crate::http::request::{OutboundRequest, RequestIdExt};
use crate::observability::content_log::ContentLogger;
use crate::recording::dispatch::RecordingDispatcher;
use crate::recording::interaction::HeaderList;
use crate::recording::recorder::InteractionRecorder;
use crate::recording::InteractionSink;

pub struct ProxyService {
    forwarder: Forwarder,
    sink: Arc<dyn InteractionSink>,
    max_body_bytes: usize,
}

impl ProxyService {
    pub fn new(forwarder: Forwarder, sink: Arc<dyn InteractionSink>, max_body_bytes: usize) -> Self {
        Self {
            forwarder,
            sink,
            max_body_bytes,
        }
    }

    /// Forwarder and recording dispatcher as described by `config`.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let base_url = Url::parse(&config.upstream.base_url).map_err(|e| {
            ConfigError::Validation(vec![ValidationError {
                field: "upstream.base_url",
                message: e.to_string(),
            }])
        })?;
        let dispatcher = RecordingDispatcher::from_config(&config.recording).map_err(|e| {
            ConfigError::Validation(vec![ValidationError {
                field: "recording.replay_speed",
                message: e.to_string(),
            }])
        })?;

        if let Some(store) = dispatcher.store() {
            tracing::info!(directory = %store.directory().display(), "Recording interactions to disk");
        }
        if let Some(speed) = dispatcher.verify_speed() {
            tracing::info!(speed = speed.get(), "Verification replay enabled");
        }

        let forwarder = Forwarder::new(base_url, Duration::from_secs(config.upstream.connect_timeout_secs));
        Ok(Self::new(
            forwarder,
            Arc::new(dispatcher),
            config.limits.max_request_body_bytes,
        ))
    }

    /// Forward `request` upstream, recording the exchange.
    pub async fn handle(&self, request: Request<Body>) -> Result<Response, ProxyError> {
        let request_id = request.request_id().to_string();
        let outbound = OutboundRequest::from_inbound(request, self.max_body_bytes).await?;

        let target = self.forwarder.target_url(&outbound.path_and_query);
        let sent_headers = match target.parse::<Uri>() {
            Ok(uri) => self.forwarder.outbound_headers(&outbound.headers, &uri),
            Err(_) => outbound.headers.clone(),
        };

        tracing::debug!(
            request_id = %request_id,
            method = %outbound.method,
            target = %target,
            "Forwarding request"
        );

        let recorder = InteractionRecorder::new(
            target,
            outbound.method.clone(),
            HeaderList::from_header_map(&sent_headers),
            outbound.body.clone(),
        );
        let content_log = ContentLogger::new(&outbound.method, outbound.path());
        content_log.log_request_body(outbound.body.as_deref());

        let events = self.forwarder.forward(&outbound);
        ResponsePipeline::new(recorder, content_log, Arc::clone(&self.sink))
            .with_request_id(request_id)
            .run(events)
            .await
    }
}
