//! Recorded request/response data model.
//!
//! An [`Interaction`] pairs one forwarded request with its response as it
//! arrived on the wire. The response is absent until the upstream head
//! arrives and is sealed once its `end_time` is set.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use serde::{Deserialize, Serialize};

use crate::recording::clock::Timestamp;

/// Ordered header list. Names compare case-insensitively and duplicates
/// keep their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Capture headers from an `http` header map, in iteration order.
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let entries = map
            .iter()
            .map(|(name, value)| {
                let value = match value.to_str() {
                    Ok(v) => v.to_string(),
                    Err(_) => {
                        tracing::debug!(header = %name, "Header value is not UTF-8; storing lossy text");
                        String::from_utf8_lossy(value.as_bytes()).into_owned()
                    }
                };
                (name.as_str().to_string(), value)
            })
            .collect();
        Self(entries)
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether any comma-separated value of `name` equals `token`
    /// (ASCII case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Rebuild an `http` header map. Entries that are not valid HTTP
    /// header names or values are skipped.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.0.len());
        for (name, value) in &self.0 {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::debug!(header = %name, "Skipping unrepresentable header");
                continue;
            };
            map.append(name, value);
        }
        map
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect())
    }
}

/// The forwarded request. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub url: String,
    #[serde(with = "wire::method")]
    pub method: Method,
    pub headers: HeaderList,
    #[serde(with = "wire::opt_bytes", default)]
    pub body: Option<Bytes>,
    pub start_time: Timestamp,
}

/// One body part and the moment it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyChunk {
    #[serde(with = "wire::bytes")]
    pub bytes: Bytes,
    pub arrival: Timestamp,
}

/// The upstream response as observed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedResponse {
    #[serde(with = "wire::status")]
    pub status: StatusCode,
    pub headers: HeaderList,
    #[serde(with = "wire::version")]
    pub version: Version,
    pub header_arrival: Timestamp,
    pub body_chunks: Vec<BodyChunk>,
    pub end_time: Option<Timestamp>,
}

impl RecordedResponse {
    pub fn new(status: StatusCode, headers: HeaderList, version: Version, at: Timestamp) -> Self {
        Self {
            status,
            headers,
            version,
            header_arrival: at,
            body_chunks: Vec::new(),
            end_time: None,
        }
    }

    /// Append a chunk. Arrival times are clamped so the sequence never
    /// goes backwards.
    pub(crate) fn append(&mut self, bytes: Bytes, at: Timestamp) {
        let floor = self.last_arrival();
        self.body_chunks.push(BodyChunk {
            bytes,
            arrival: at.max(floor),
        });
    }

    pub(crate) fn seal(&mut self, at: Timestamp) {
        self.end_time = Some(at.max(self.last_arrival()));
    }

    pub fn is_sealed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Arrival of the latest chunk, or the head if there are none.
    pub fn last_arrival(&self) -> Timestamp {
        self.body_chunks
            .last()
            .map(|c| c.arrival)
            .unwrap_or(self.header_arrival)
    }

    /// Total body length across all chunks.
    pub fn body_len(&self) -> usize {
        self.body_chunks.iter().map(|c| c.bytes.len()).sum()
    }

    /// All chunks concatenated in arrival order.
    pub fn body(&self) -> Bytes {
        if let [only] = self.body_chunks.as_slice() {
            return only.bytes.clone();
        }
        let mut body = Vec::with_capacity(self.body_len());
        for chunk in &self.body_chunks {
            body.extend_from_slice(&chunk.bytes);
        }
        Bytes::from(body)
    }

    /// Whether the upstream used chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }
}

/// A recorded request and, once the head arrived, its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub request: RecordedRequest,
    pub response: Option<RecordedResponse>,
}

impl Interaction {
    pub fn new(request: RecordedRequest) -> Self {
        Self {
            request,
            response: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.response.as_ref().is_some_and(RecordedResponse::is_sealed)
    }

    /// Check the timing invariants of a recording:
    /// `start <= head <= chunk[0] <= .. <= chunk[n] <= end`.
    pub fn timing_is_consistent(&self) -> bool {
        let Some(response) = &self.response else {
            return true;
        };
        if response.header_arrival < self.request.start_time {
            return false;
        }
        let mut previous = response.header_arrival;
        for chunk in &response.body_chunks {
            if chunk.arrival < previous {
                return false;
            }
            previous = chunk.arrival;
        }
        response.end_time.map_or(true, |end| end >= previous)
    }
}

/// Serde adapters for `http` types and byte bodies in the recording format.
mod wire {
    pub mod bytes {
        use axum::body::Bytes;
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&STANDARD.encode(bytes))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
            let encoded = String::deserialize(deserializer)?;
            STANDARD
                .decode(encoded.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom)
        }
    }

    pub mod opt_bytes {
        use axum::body::Bytes;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(bytes: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => super::bytes::serialize(b, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapped(#[serde(with = "super::bytes")] Bytes);

            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(b)| b))
        }
    }

    pub mod method {
        use axum::http::Method;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(method.as_str())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
            let raw = String::deserialize(deserializer)?;
            Method::from_bytes(raw.as_bytes()).map_err(serde::de::Error::custom)
        }
    }

    pub mod status {
        use axum::http::StatusCode;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_u16(status.as_u16())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StatusCode, D::Error> {
            let code = u16::deserialize(deserializer)?;
            StatusCode::from_u16(code).map_err(serde::de::Error::custom)
        }
    }

    pub mod version {
        use axum::http::Version;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(version: &Version, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&format!("{:?}", version))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Version, D::Error> {
            let raw = String::deserialize(deserializer)?;
            match raw.as_str() {
                "HTTP/0.9" => Ok(Version::HTTP_09),
                "HTTP/1.0" => Ok(Version::HTTP_10),
                "HTTP/1.1" => Ok(Version::HTTP_11),
                "HTTP/2.0" => Ok(Version::HTTP_2),
                "HTTP/3.0" => Ok(Version::HTTP_3),
                other => Err(serde::de::Error::custom(format!("unknown HTTP version {other}"))),
            }
        }
    }
}
