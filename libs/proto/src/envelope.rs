//! The envelope wrapping every frame on the wire.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Verb;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("invalid {verb} payload: {source}")]
    InvalidPayload {
        verb: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {verb} frame: {source}")]
    Encode {
        verb: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Verb discriminator. Kept as a string so unknown verbs survive decoding.
    #[serde(rename = "type")]
    pub kind: String,

    /// Correlation id; absent on fire-and-forget frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Verb-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Builds a request that expects a correlated `RESPONSE`.
    pub fn request<P: Serialize>(
        verb: &str,
        request_id: impl Into<String>,
        payload: &P,
    ) -> Result<Self, ProtoError> {
        Ok(Self {
            kind: verb.to_string(),
            request_id: Some(request_id.into()),
            payload: encode_payload(verb, payload)?,
        })
    }

    /// Builds a fire-and-forget frame (heartbeat, broadcast, register).
    pub fn notify<P: Serialize>(verb: &str, payload: &P) -> Result<Self, ProtoError> {
        Ok(Self {
            kind: verb.to_string(),
            request_id: None,
            payload: encode_payload(verb, payload)?,
        })
    }

    /// Wraps a response payload in a `RESPONSE` frame.
    pub fn response(response: &ResponsePayload) -> Result<Self, ProtoError> {
        Self::notify(Verb::Response.as_str(), response)
    }

    /// The known verb for this frame, if any.
    pub fn verb(&self) -> Option<Verb> {
        Verb::parse(&self.kind)
    }

    /// Decodes the payload into a typed message.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| ProtoError::InvalidPayload {
            verb: self.kind.clone(),
            source,
        })
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|source| ProtoError::Encode {
            verb: self.kind.clone(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(text).map_err(ProtoError::Malformed)
    }
}

fn encode_payload<P: Serialize>(verb: &str, payload: &P) -> Result<Value, ProtoError> {
    serde_json::to_value(payload).map_err(|source| ProtoError::Encode {
        verb: verb.to_string(),
        source,
    })
}

/// Outcome of a request as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Payload of a `RESPONSE` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    pub fn success(request_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Success,
            data,
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Error,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Decodes `data` into `T`, treating a missing body as JSON `null`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null)).map_err(|source| {
            ProtoError::InvalidPayload {
                verb: Verb::Response.as_str().to_string(),
                source,
            }
        })
    }
}
