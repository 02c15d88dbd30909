//! Every record that crosses a socket: the peer-to-peer envelope used by the
//! mutual-exclusion engine and the frames of the client protocol.

use serde::{Deserialize, Serialize};
use std::error::Error;

use crate::error::ServiceError;
use crate::event::{Event, EventId, JobId};

// ---------------------------------------------------------------------------
// peer wire
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessageKind {
    #[serde(rename = "REQ")]
    Request,
    #[serde(rename = "ACK")]
    Acknowledge,
    #[serde(rename = "REL")]
    Release,
}

/// One frame between replicas. `payload` is the full catalog and is only
/// present on `REL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEnvelope {
    pub kind: PeerMessageKind,
    pub sender_id: u32,
    pub clock: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<Event>>,
}

impl PeerEnvelope {
    pub fn request(sender_id: u32, clock: u64) -> Self {
        Self {
            kind: PeerMessageKind::Request,
            sender_id,
            clock,
            payload: None,
        }
    }

    pub fn acknowledge(sender_id: u32, clock: u64) -> Self {
        Self {
            kind: PeerMessageKind::Acknowledge,
            sender_id,
            clock,
            payload: None,
        }
    }

    pub fn release(sender_id: u32, clock: u64, catalog: Vec<Event>) -> Self {
        Self {
            kind: PeerMessageKind::Release,
            sender_id,
            clock,
            payload: Some(catalog),
        }
    }

    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_string(frame: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(frame)?)
    }
}

/// First frame on a freshly dialed peer socket, so the acceptor can register
/// it under the right id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Greeting {
    pub id: u32,
}

impl Greeting {
    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_string(frame: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(frame)?)
    }
}

// ---------------------------------------------------------------------------
// client wire
// ---------------------------------------------------------------------------

/// Identity a successful authentication yields; -1 while unauthenticated.
pub type AuthId = i32;

/// First server frame of a request, answering the endpoint line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderResponse {
    pub valid: bool,
    pub needs_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    pub auth_id: AuthId,
}

/// Final frame of every request. On failure `data` is the error string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResponse {
    pub success: bool,
    pub data: serde_json::Value,
}

impl ServerResponse {
    pub fn success<T: Serialize>(data: &T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn failure(error: ServiceError) -> Self {
        Self {
            success: false,
            data: serde_json::Value::String(error.to_string()),
        }
    }

    pub fn failure_text(message: &str) -> Self {
        Self {
            success: false,
            data: serde_json::Value::String(message.to_string()),
        }
    }

    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_string(frame: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(frame)?)
    }
}

// Request payloads. Fields default to their zero value when a client omits
// them, and the handlers report the resulting lookup failures.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub capacity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCreate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<JobCreate>,
}

/// `event_id == -1` asks for the whole catalog. `resume` is a rendering hint
/// for the client and is ignored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventShow {
    #[serde(default)]
    pub event_id: EventId,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventClose {
    #[serde(default)]
    pub event_id: EventId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRegister {
    #[serde(default)]
    pub event_id: EventId,
    #[serde(default)]
    pub job_id: JobId,
}
