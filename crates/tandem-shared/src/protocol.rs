use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::chunk::ContentChunk;
use crate::error::ProtocolError;
use crate::types::{TemplateContent, UserId};

/// Raw `{event, data}` envelope every client frame must match.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Events a client may send to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Open (or replace) the sender's call for help
    RequestAssistance(RequestAssistance),

    /// Become the helper of an open request
    JoinAssistance(JoinAssistance),

    /// Relay template content to a peer, chunked
    SendTemplateContent(SendTemplateContent),

    /// Tell a peer to switch the file it is viewing
    SwitchContentFile(SwitchContentFile),

    /// Chat message to a peer
    SendMessage(SendMessage),

    /// Close a request
    EndAssistance(EndAssistance),

    /// Snapshot of the public request list, for the sender only
    GetAssistanceList,

    /// Chat history between the sender and one peer
    GetMessageHistory(GetMessageHistory),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAssistance {
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_content: Option<TemplateContent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAssistance {
    pub requester_uuid: UserId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTemplateContent {
    pub content: TemplateContent,
    pub to_uuid: UserId,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub template_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchContentFile {
    pub switch_file: String,
    pub to_uuid: UserId,
    #[serde(default)]
    pub template_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub to_uuid: UserId,
    pub content: String,
    #[serde(default)]
    pub template_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndAssistance {
    #[serde(default)]
    pub requester_uuid: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessageHistory {
    pub with_uuid: UserId,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl InboundEvent {
    /// Decode one client frame.
    ///
    /// A frame that is not a `{event, data}` object, or whose payload does not
    /// fit the event, is a [`ProtocolError::Decode`]. A well-formed envelope
    /// naming an event we do not handle is [`ProtocolError::UnknownEvent`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let Envelope { event, data } =
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;

        let decoded = match event.as_str() {
            "request-assistance" => Self::RequestAssistance(payload(&event, data)?),
            "join-assistance" => Self::JoinAssistance(payload(&event, data)?),
            "send-template-content" => Self::SendTemplateContent(payload(&event, data)?),
            "switch-content-file" => Self::SwitchContentFile(payload(&event, data)?),
            "send-message" => Self::SendMessage(payload(&event, data)?),
            "end-assistance" => Self::EndAssistance(payload(&event, data)?),
            "get-assistance-list" => Self::GetAssistanceList,
            "get-message-history" => Self::GetMessageHistory(payload(&event, data)?),
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };

        Ok(decoded)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestAssistance(_) => "request-assistance",
            Self::JoinAssistance(_) => "join-assistance",
            Self::SendTemplateContent(_) => "send-template-content",
            Self::SwitchContentFile(_) => "switch-content-file",
            Self::SendMessage(_) => "send-message",
            Self::EndAssistance(_) => "end-assistance",
            Self::GetAssistanceList => "get-assistance-list",
            Self::GetMessageHistory(_) => "get-message-history",
        }
    }
}

/// Missing or null `data` is read as an empty object so that events whose
/// fields are all optional still decode.
fn payload<T: DeserializeOwned>(event: &str, data: serde_json::Value) -> Result<T, ProtocolError> {
    let data = if data.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| ProtocolError::Decode(format!("invalid '{event}' payload: {e}")))
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Events the relay sends to clients, encoded as `{"event": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    UserConnected(UserInfo),
    AssistanceListUpdated(Vec<AssistanceSummary>),
    AssistanceRequested(Ack),
    HelperJoined(HelperJoined),
    AssistanceJoined(AssistanceJoined),
    HelperLeave(Ack),
    TemplateContentChunk(ChunkFrame),
    GetSwitchFile(SwitchFile),
    MessageReceived(MessageReceived),
    MessageSent(MessageSent),
    AssistanceEnded(Ack),
    AssistanceList(Vec<AssistanceSummary>),
    MessageHistory(MessageHistory),
    Error(ErrorPayload),
}

impl OutboundEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::UserConnected(_) => "user-connected",
            Self::AssistanceListUpdated(_) => "assistance-list-updated",
            Self::AssistanceRequested(_) => "assistance-requested",
            Self::HelperJoined(_) => "helper-joined",
            Self::AssistanceJoined(_) => "assistance-joined",
            Self::HelperLeave(_) => "helper-leave",
            Self::TemplateContentChunk(_) => "template-content-chunk",
            Self::GetSwitchFile(_) => "get-switch-file",
            Self::MessageReceived(_) => "message-received",
            Self::MessageSent(_) => "message-sent",
            Self::AssistanceEnded(_) => "assistance-ended",
            Self::AssistanceList(_) => "assistance-list",
            Self::MessageHistory(_) => "message-history",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub uuid: UserId,
    pub template_id: String,
    pub is_requesting_help: bool,
}

/// Public view of one assistance request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistanceSummary {
    pub requester_uuid: UserId,
    pub template_id: String,
    pub template_content: TemplateContent,
    pub show: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    pub const OK: Ack = Ack { success: true };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelperJoined {
    pub helper_uuid: UserId,
    pub template_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistanceJoined {
    pub requester_uuid: UserId,
    pub template_id: String,
}

/// A [`ContentChunk`] as delivered to its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrame {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub content: String,
    pub template_id: String,
    pub from_uuid: UserId,
    pub path: String,
}

impl From<ContentChunk> for ChunkFrame {
    fn from(chunk: ContentChunk) -> Self {
        Self {
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            content: chunk.content,
            template_id: chunk.template_id,
            from_uuid: chunk.from_uuid,
            path: chunk.path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchFile {
    pub path: String,
    pub template_id: String,
    pub from_uuid: UserId,
    pub to_uuid: UserId,
}

/// A chat message as kept in the message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub from_uuid: UserId,
    pub to_uuid: UserId,
    pub content: String,
    pub template_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    pub from_uuid: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub template_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub to_uuid: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHistory {
    pub with_uuid: UserId,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}
