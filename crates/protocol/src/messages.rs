use serde::{Deserialize, Serialize};

use crate::config::IceServerConfig;

/// Envelope carried on the async signaling transport. The wire form is
/// `{"type": "...", "value": ...}`; `value` is absent for the legacy
/// pause/resume commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WsMessage {
    /// v2 exchange: an offer/answer envelope with an inner `type` tag
    Webrtc(RtcEnvelope),
    /// v1 exchange: raw SDP offer
    #[serde(rename = "webrtc/offer")]
    WebrtcOffer(String),
    /// v1 reply: raw SDP answer
    #[serde(rename = "webrtc/answer")]
    WebrtcAnswer(String),
    /// v1 reply: the session id, sent after the answer
    #[serde(rename = "webrtc/session")]
    WebrtcSession(String),
    /// Trickled ICE candidate, both directions
    #[serde(rename = "webrtc/candidate")]
    WebrtcCandidate(String),
    /// Legacy command: pause every consumer connection in the process
    #[serde(rename = "webrtc/pause")]
    WebrtcPause,
    /// Legacy command: resume every consumer connection in the process
    #[serde(rename = "webrtc/resume")]
    WebrtcResume,
    Error(String),
}

/// Inner payload of the v2 `webrtc` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RtcEnvelope {
    Offer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_servers: Option<Vec<IceServerConfig>>,
    },
    Answer {
        sdp: String,
        session_id: String,
    },
}

/// One row of the `GET /api/webrtc/sessions` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub connection_id: u32,
    pub stream_source: String,
    pub viewer_id: String,
    pub client_ip: String,
    pub mode: String,
    pub paused: bool,
}

/// Body of the session-addressed pause/resume endpoints.
/// `session_id` is optional so a missing field maps to 400, not a
/// deserialization failure.
#[derive(Debug, Default, Deserialize)]
pub struct SessionActionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Body of the viewer-addressed pause/resume endpoints.
/// An empty or missing `viewer_id` fans out to every consumer.
#[derive(Debug, Default, Deserialize)]
pub struct ViewerActionRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub viewer_id: Option<String>,
}
