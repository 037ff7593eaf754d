//! Human-oriented logging of LLM traffic.
//!
//! Summarises each request body in one line and pulls assistant text out of
//! response bodies as they stream past. Understands Ollama NDJSON
//! (`/api/chat`, `/api/generate`) and OpenAI-compatible SSE (`/v1/...`,
//! `data: {...}` lines).
//!
//! Partial lines are carried across chunk boundaries, so a JSON record split
//! over two body parts is still parsed once complete. Nothing here can fail
//! the proxied request: unparsable input is logged at debug and skipped.

use axum::http::{Method, StatusCode};
use serde_json::Value;

/// Longest partial line kept between chunks. Longer lines are dropped up to
/// their newline and counted as skipped.
const MAX_PENDING_LINE: usize = 1024 * 1024;

/// Which response dialect to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    Ollama,
    OpenAi,
}

impl ApiFlavor {
    pub fn for_path(path: &str) -> Self {
        if path.starts_with("/v1") {
            ApiFlavor::OpenAi
        } else {
            ApiFlavor::Ollama
        }
    }
}

/// Per-request content logger.
#[derive(Debug)]
pub struct ContentLogger {
    method: Method,
    path: String,
    flavor: ApiFlavor,
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    /// Dropping the rest of an over-long line.
    discarding: bool,
    transcript: String,
    skipped: usize,
}

impl ContentLogger {
    pub fn new(method: &Method, path: &str) -> Self {
        tracing::info!(method = %method, path = %path, "REQ");
        Self {
            method: method.clone(),
            path: path.to_string(),
            flavor: ApiFlavor::for_path(path),
            pending: Vec::new(),
            scanned: 0,
            discarding: false,
            transcript: String::new(),
            skipped: 0,
        }
    }

    pub fn flavor(&self) -> ApiFlavor {
        self.flavor
    }

    /// Assistant text seen so far.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Number of lines that could not be parsed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// One-line summary of the outbound request body.
    pub fn log_request_body(&self, body: Option<&[u8]>) {
        let Some(body) = body else {
            return;
        };
        let Ok(json) = serde_json::from_slice::<Value>(body) else {
            tracing::debug!(path = %self.path, bytes = body.len(), "Request body is not JSON");
            return;
        };
        let model = json.get("model").and_then(Value::as_str).unwrap_or("-");
        let stream = json.get("stream").and_then(Value::as_bool);
        let messages = json
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        tracing::info!(
            method = %self.method,
            path = %self.path,
            model,
            stream = ?stream,
            messages,
            bytes = body.len(),
            "Request body"
        );
    }

    pub fn response_started(&self, status: StatusCode) {
        tracing::info!(path = %self.path, status = %status, "RSP starting");
    }

    /// Feed one streamed body part. Returns the text fragments extracted
    /// from every line completed by this part.
    pub fn observe_chunk(&mut self, mut bytes: &[u8]) -> Vec<String> {
        if self.discarding {
            match bytes.iter().position(|b| *b == b'\n') {
                Some(newline) => {
                    self.discarding = false;
                    bytes = &bytes[newline + 1..];
                }
                None => return Vec::new(),
            }
        }

        let mut pending = std::mem::take(&mut self.pending);
        pending.extend_from_slice(bytes);
        let mut fragments = Vec::new();
        let mut line_start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = pending[search_from..].iter().position(|b| *b == b'\n') {
            let newline = search_from + offset;
            if let Some(text) = self.observe_line(&pending[line_start..newline]) {
                fragments.push(text);
            }
            line_start = newline + 1;
            search_from = line_start;
        }
        pending.drain(..line_start);

        if pending.len() > MAX_PENDING_LINE {
            self.skipped += 1;
            self.discarding = true;
            tracing::debug!(path = %self.path, bytes = pending.len(), "Line too long, dropping it");
            pending.clear();
        }
        self.scanned = pending.len();
        self.pending = pending;
        fragments
    }

    /// Feed a complete, non-streamed body.
    pub fn observe_full_body(&mut self, body: &[u8]) {
        if let Ok(json) = serde_json::from_slice::<Value>(body) {
            if let Some(text) = full_body_text(self.flavor, &json) {
                self.transcript.push_str(&text);
            }
            return;
        }
        // Streamed dialects sometimes arrive without chunked framing.
        self.observe_chunk(body);
        self.flush();
    }

    /// Parse whatever is left in the line buffer and log the transcript.
    pub fn finish(&mut self, status: StatusCode) {
        self.flush();
        tracing::info!(
            path = %self.path,
            status = %status,
            chars = self.transcript.chars().count(),
            skipped = self.skipped,
            "RSP completed"
        );
        if !self.transcript.is_empty() {
            tracing::debug!(path = %self.path, transcript = %self.transcript, "Assistant text");
        }
    }

    fn flush(&mut self) {
        self.scanned = 0;
        self.discarding = false;
        if self.pending.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.pending);
        self.observe_line(&rest);
    }

    fn observe_line(&mut self, raw: &[u8]) -> Option<String> {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(_) => {
                self.skipped += 1;
                return None;
            }
        };
        match line_text(self.flavor, line) {
            Ok(Some(text)) => {
                tracing::debug!(path = %self.path, text = %text, "delta");
                self.transcript.push_str(&text);
                Some(text)
            }
            Ok(None) => None,
            Err(e) => {
                self.skipped += 1;
                tracing::debug!(path = %self.path, error = %e, line, "Invalid JSON data");
                None
            }
        }
    }
}

/// Text carried by one NDJSON or SSE line. `Ok(None)` for lines that carry
/// no text (blank lines, SSE comments and events, `[DONE]`, final records).
fn line_text(flavor: ApiFlavor, line: &str) -> Result<Option<String>, serde_json::Error> {
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => line,
    };
    if payload.is_empty()
        || payload == "[DONE]"
        || payload.starts_with(':')
        || payload.starts_with("event:")
        || payload.starts_with("id:")
        || payload.starts_with("retry:")
    {
        return Ok(None);
    }

    let json: Value = serde_json::from_str(payload)?;
    let text = match flavor {
        ApiFlavor::OpenAi => openai_delta(&json),
        ApiFlavor::Ollama => ollama_delta(&json),
    };
    Ok(text.filter(|t| !t.is_empty()))
}

fn openai_delta(json: &Value) -> Option<String> {
    let choice = json.get("choices")?.get(0)?;
    match json.get("object").and_then(Value::as_str) {
        Some("chat.completion.chunk") => {
            let delta = choice.get("delta");
            let mut text = String::new();
            for field in ["reasoning_content", "content"] {
                if let Some(part) = delta.and_then(|d| d.get(field)).and_then(Value::as_str) {
                    text.push_str(part);
                }
            }
            if let Some(part) = choice.get("content").and_then(Value::as_str) {
                text.push_str(part);
            }
            Some(text)
        }
        Some("text_completion") => choice.get("text").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn ollama_delta(json: &Value) -> Option<String> {
    let mut text = String::new();
    if let Some(message) = json.get("message") {
        for field in ["thinking", "content"] {
            if let Some(part) = message.get(field).and_then(Value::as_str) {
                text.push_str(part);
            }
        }
    }
    // /api/generate
    for field in ["thinking", "response"] {
        if let Some(part) = json.get(field).and_then(Value::as_str) {
            text.push_str(part);
        }
    }
    Some(text)
}

fn full_body_text(flavor: ApiFlavor, json: &Value) -> Option<String> {
    match flavor {
        ApiFlavor::OpenAi => json
            .get("choices")?
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()
            .map(str::to_string),
        ApiFlavor::Ollama => ollama_delta(json).filter(|t| !t.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_chat_lines() {
        let mut log = ContentLogger::new(&Method::POST, "/api/chat");
        let out = log.observe_chunk(
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n\
              {\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
        );
        assert_eq!(out, vec!["Hel", "lo"]);
        assert_eq!(log.transcript(), "Hello");
    }

    #[test]
    fn record_split_across_chunks_is_reassembled() {
        let mut log = ContentLogger::new(&Method::POST, "/api/generate");
        assert!(log.observe_chunk(b"{\"response\":\"wor").is_empty());
        assert_eq!(log.observe_chunk(b"ld\",\"done\":false}\n"), vec!["world"]);
        assert_eq!(log.skipped(), 0);
    }

    #[test]
    fn many_lines_in_one_chunk_after_a_partial() {
        let mut log = ContentLogger::new(&Method::POST, "/api/generate");
        assert!(log.observe_chunk(b"{\"response\":\"a\"").is_empty());
        let out = log.observe_chunk(b"}\n{\"response\":\"b\"}\n{\"response\":\"c\"}\n{\"resp");
        assert_eq!(out, vec!["a", "b", "c"]);
        assert_eq!(log.pending, b"{\"resp");
        assert_eq!(log.scanned, log.pending.len());
    }

    #[test]
    fn newline_free_stream_stays_bounded() {
        let mut log = ContentLogger::new(&Method::POST, "/api/generate");
        let part = vec![b'x'; 8 * 1024];
        for _ in 0..2000 {
            assert!(log.observe_chunk(&part).is_empty());
            assert!(log.pending.len() <= MAX_PENDING_LINE);
        }
        assert_eq!(log.skipped(), 1);

        // The tail of the dropped line ends at the next newline; later
        // records parse normally.
        let out = log.observe_chunk(b"xxxx\n{\"response\":\"ok\"}\n");
        assert_eq!(out, vec!["ok"]);
        assert_eq!(log.skipped(), 1);
        assert!(log.pending.is_empty());
    }

    #[test]
    fn openai_sse_lines() {
        let mut log = ContentLogger::new(&Method::POST, "/v1/chat/completions");
        assert_eq!(log.flavor(), ApiFlavor::OpenAi);
        let out = log.observe_chunk(
            b"data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n\
              data: [DONE]\n\n",
        );
        assert_eq!(out, vec!["Hi"]);
        assert_eq!(log.skipped(), 0);
    }

    #[test]
    fn garbage_is_skipped_not_fatal() {
        let mut log = ContentLogger::new(&Method::POST, "/api/chat");
        assert!(log.observe_chunk(b"not json\n").is_empty());
        assert_eq!(log.skipped(), 1);
        log.observe_chunk(b"{\"message\":{\"content\":\"ok\"}}");
        log.finish(StatusCode::OK);
        assert_eq!(log.transcript(), "ok");
    }

    #[test]
    fn full_openai_body() {
        let mut log = ContentLogger::new(&Method::POST, "/v1/chat/completions");
        log.observe_full_body(
            br#"{"object":"chat.completion","choices":[{"message":{"role":"assistant","content":"Done."}}]}"#,
        );
        assert_eq!(log.transcript(), "Done.");
    }

    #[test]
    fn request_summary_tolerates_non_json() {
        let log = ContentLogger::new(&Method::POST, "/api/chat");
        log.log_request_body(Some(b"\x00\x01"));
        log.log_request_body(Some(br#"{"model":"llama3","messages":[{"role":"user","content":"hi"}]}"#));
        log.log_request_body(None);
    }
}
