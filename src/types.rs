//! Shared wire types for the ask-continue MCP server
//!
//! Mirrors the JSON bodies exchanged with the editor extension so the
//! protocol stays compatible across the HTTP boundary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Outbound query sent to a candidate window's `/ask` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    /// Message discriminator, always `"ask_continue"`
    #[serde(rename = "type")]
    pub message_type: String,

    /// Correlation id the extension must echo back in its reply
    #[serde(rename = "requestId")]
    pub request_id: String,

    /// Why the agent is pausing for the user
    pub reason: String,

    /// Base URL of the callback listener, e.g. `http://127.0.0.1:23984`
    #[serde(rename = "callbackAddress")]
    pub callback_address: String,
}

/// Acknowledgement body from a window that accepted the query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskAccepted {
    #[serde(default)]
    pub success: bool,
}

/// Error body from a window that declined (409) or failed (500).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateError {
    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub details: Option<String>,
}

/// Inbound reply delivered by the extension to the callback listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPayload {
    #[serde(rename = "requestId")]
    pub request_id: String,

    /// Raw user text; empty means "end the conversation"
    #[serde(rename = "userInput", default)]
    pub user_input: String,

    /// True when the user dismissed the prompt instead of answering
    #[serde(default)]
    pub cancelled: bool,
}

/// One registration record written by a live extension window.
///
/// `time` and `pid` are advisory; a record with only a port is still usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub port: u16,

    #[serde(default)]
    pub time: u64,

    #[serde(default)]
    pub pid: Option<u32>,
}

/// A reachable extension window, ranked by registration recency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateEndpoint {
    pub address: SocketAddr,
    pub registered_at: u64,
}

/// Classification of a single probe attempt against one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The window took the query; a reply will arrive on the callback listener
    Accepted,
    /// Reachable but declined, typically because the window is not focused
    Busy(String),
    /// Reachable but returned an application-level error
    Rejected(String),
    /// No usable response: refused, timed out, or malformed
    Unreachable(String),
}

impl DispatchOutcome {
    pub fn is_busy(&self) -> bool {
        matches!(self, DispatchOutcome::Busy(_))
    }
}

/// Resolution handed from the callback listener to the waiting dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Input(String),
    Cancelled,
}
