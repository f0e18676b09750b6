//! Envelope types for the framed peer dispatch protocol.
//!
//! A client sends [`RequestEnvelope`]s and receives [`ResponseFrame`]s;
//! both directions are multiplexed over one connection by request id.
//! Unary operations answer with exactly one response frame; streaming
//! operations answer with zero or more item frames followed by `Done`, or
//! an `Error` frame terminating the stream. `Cancel` aborts server-side
//! work for an in-flight request id.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::dispatch::errors::DispatchError;
use crate::types::{
    CheckRequest, CheckResponse, ExpandRequest, ExpandResponse, LookupResourcesRequest,
    LookupResourcesResponse, LookupSubjectsRequest, LookupSubjectsResponse,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    /// Remaining deadline budget of the caller, if any, so the server can
    /// derive a matching context deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_millis: Option<u64>,
    pub body: RequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    Check(CheckRequest),
    Expand(ExpandRequest),
    LookupResources(LookupResourcesRequest),
    LookupSubjects(LookupSubjectsRequest),
    Cancel,
}

impl RequestBody {
    /// Short operation label for logs.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Check(_) => "check",
            Self::Expand(_) => "expand",
            Self::LookupResources(_) => "lookup_resources",
            Self::LookupSubjects(_) => "lookup_subjects",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    Check(CheckResponse),
    Expand(ExpandResponse),
    LookupResourcesItem(LookupResourcesResponse),
    LookupSubjectsItem(LookupSubjectsResponse),
    /// Clean end of a streaming response.
    Done,
    /// Terminal failure, carrying the stable taxonomy code.
    Error { code: u16, message: String },
}

impl ResponseBody {
    #[must_use]
    pub fn from_error(error: &DispatchError) -> Self {
        Self::Error { code: error.code(), message: error.wire_message() }
    }
}

pub fn encode_request(envelope: &RequestEnvelope) -> Result<Bytes, DispatchError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| DispatchError::Internal(format!("failed to encode request frame: {e}")))
}

pub fn decode_request(payload: &Bytes) -> Result<RequestEnvelope, DispatchError> {
    serde_json::from_slice(payload)
        .map_err(|e| DispatchError::Internal(format!("failed to decode request frame: {e}")))
}

pub fn encode_response(frame: &ResponseFrame) -> Result<Bytes, DispatchError> {
    serde_json::to_vec(frame)
        .map(Bytes::from)
        .map_err(|e| DispatchError::Internal(format!("failed to encode response frame: {e}")))
}

pub fn decode_response(payload: &Bytes) -> Result<ResponseFrame, DispatchError> {
    serde_json::from_slice(payload)
        .map_err(|e| DispatchError::Internal(format!("failed to decode response frame: {e}")))
}
