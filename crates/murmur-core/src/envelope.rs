//! murmur wire envelopes.
//!
//! Every frame is one JSON object: `{"type": "<kind>", "<kind>": {...payload}}`.
//! Inbound and outbound frames share discriminators but carry different
//! payloads, so each direction gets its own enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, MurmurError};

/// Well-known identifier of the global public channel.
pub const PUBLIC_CHANNEL: &str = "public";

/// Page size used when a history request omits `limit`.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// A chat message as persisted in channel history and pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender: String,
    /// Empty for the public channel.
    #[serde(default)]
    pub recipient: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

// ── Client → server ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEnvelope {
    SignUp {
        #[serde(rename = "signUp")]
        sign_up: SignUpRequest,
    },
    SignIn {
        #[serde(rename = "signIn")]
        sign_in: SignInRequest,
    },
    ChannelJoin {
        #[serde(rename = "channelJoin", default)]
        channel_join: ChannelJoinRequest,
    },
    ChannelLeave {
        #[serde(rename = "channelLeave")]
        channel_leave: ChannelLeaveRequest,
    },
    ChannelMessage {
        #[serde(rename = "channelMessage")]
        channel_message: ChannelMessageRequest,
    },
    ChannelMessages {
        #[serde(rename = "channelMessages", default)]
        channel_messages: ChannelMessagesRequest,
    },
    Users,
}

impl ClientEnvelope {
    /// Discriminator string, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEnvelope::SignUp { .. } => "signUp",
            ClientEnvelope::SignIn { .. } => "signIn",
            ClientEnvelope::ChannelJoin { .. } => "channelJoin",
            ClientEnvelope::ChannelLeave { .. } => "channelLeave",
            ClientEnvelope::ChannelMessage { .. } => "channelMessage",
            ClientEnvelope::ChannelMessages { .. } => "channelMessages",
            ClientEnvelope::Users => "users",
        }
    }

    /// Whether this request may be sent before the session is authenticated.
    pub fn is_auth_request(&self) -> bool {
        matches!(
            self,
            ClientEnvelope::SignUp { .. } | ClientEnvelope::SignIn { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub username: String,
    pub password: String,
}

/// Sign in with either the password or a previously issued access key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInRequest {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelJoinRequest {
    /// Peer user ID; absent or empty means the public channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

/// Leave by channel ID, or by the peer the channel was joined with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelLeaveRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessagesRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

impl Default for ChannelMessagesRequest {
    fn default() -> Self {
        Self {
            recipient: None,
            offset: 0,
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

fn default_history_limit() -> i64 {
    DEFAULT_HISTORY_LIMIT
}

// ── Server → client ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEnvelope {
    Authorized {
        authorized: Authorized,
    },
    ChannelJoin {
        #[serde(rename = "channelJoin")]
        channel_join: ChannelJoined,
    },
    ChannelLeave {
        #[serde(rename = "channelLeave")]
        channel_leave: ChannelLeft,
    },
    ChannelMessage {
        #[serde(rename = "channelMessage")]
        channel_message: ChatMessage,
    },
    ChannelMessages {
        #[serde(rename = "channelMessages")]
        channel_messages: MessagePage,
    },
    Users {
        users: UserList,
    },
    Sys {
        sys: SysEvent,
    },
}

impl ServerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::Authorized { .. } => "authorized",
            ServerEnvelope::ChannelJoin { .. } => "channelJoin",
            ServerEnvelope::ChannelLeave { .. } => "channelLeave",
            ServerEnvelope::ChannelMessage { .. } => "channelMessage",
            ServerEnvelope::ChannelMessages { .. } => "channelMessages",
            ServerEnvelope::Users { .. } => "users",
            ServerEnvelope::Sys { .. } => "sys",
        }
    }

    /// Build a `sys` error envelope for the requesting session.
    pub fn error(err: &MurmurError) -> Self {
        ServerEnvelope::Sys {
            sys: SysEvent::Error {
                code: err.kind(),
                message: err.to_string(),
            },
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        ServerEnvelope::Sys {
            sys: SysEvent::Notice {
                message: message.into(),
            },
        }
    }

    /// If this is a `sys` error, turn it back into a typed error.
    pub fn into_error(self) -> Option<MurmurError> {
        match self {
            ServerEnvelope::Sys {
                sys: SysEvent::Error { code, message },
            } => Some(MurmurError::from_wire(code, message)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorized {
    pub user_id: String,
    pub username: String,
    pub access_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelJoined {
    pub channel: String,
    /// Empty for the public channel.
    #[serde(default)]
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLeft {
    pub channel: String,
}

/// One page of channel history, newest message first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub channel: String,
    pub offset: i64,
    pub limit: i64,
    pub messages: Vec<ChatMessage>,
    pub messages_total: u64,
    pub messages_received: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    pub total: usize,
    pub received: usize,
    pub users: Vec<UserInfo>,
}

/// System notifications. Errors go only to the session that caused them;
/// the other kinds are fanned out to channel members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SysEvent {
    Error {
        code: ErrorKind,
        message: String,
    },
    SignIn {
        user_id: String,
        username: String,
    },
    ChannelJoin {
        channel: String,
        user_id: String,
        username: String,
    },
    ChannelLeave {
        channel: String,
        user_id: String,
        username: String,
    },
    Notice {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_envelope_shape() {
        let raw = json!({
            "type": "channelMessage",
            "channelMessage": { "recipient": "bob", "text": "hi" }
        });
        let env: ClientEnvelope = serde_json::from_value(raw).unwrap();
        match env {
            ClientEnvelope::ChannelMessage { channel_message } => {
                assert_eq!(channel_message.recipient.as_deref(), Some("bob"));
                assert_eq!(channel_message.text, "hi");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn users_request_has_no_payload() {
        let env: ClientEnvelope = serde_json::from_str(r#"{"type":"users"}"#).unwrap();
        assert!(matches!(env, ClientEnvelope::Users));
        assert_eq!(env.kind(), "users");
    }

    #[test]
    fn join_without_payload_targets_public() {
        let env: ClientEnvelope = serde_json::from_str(r#"{"type":"channelJoin"}"#).unwrap();
        match env {
            ClientEnvelope::ChannelJoin { channel_join } => assert!(channel_join.recipient.is_none()),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn history_request_defaults() {
        let env: ClientEnvelope =
            serde_json::from_str(r#"{"type":"channelMessages","channelMessages":{"recipient":"b"}}"#)
                .unwrap();
        match env {
            ClientEnvelope::ChannelMessages { channel_messages } => {
                assert_eq!(channel_messages.offset, 0);
                assert_eq!(channel_messages.limit, DEFAULT_HISTORY_LIMIT);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn sign_in_with_access_key() {
        let env: ClientEnvelope = serde_json::from_str(
            r#"{"type":"signIn","signIn":{"username":"alice","accessKey":"abc"}}"#,
        )
        .unwrap();
        match env {
            ClientEnvelope::SignIn { sign_in } => {
                assert!(sign_in.password.is_none());
                assert_eq!(sign_in.access_key.as_deref(), Some("abc"));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type":"teleport"}"#).is_err());
        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type":"signUp"}"#).is_err());
    }

    #[test]
    fn sys_error_shape() {
        let env = ServerEnvelope::error(&MurmurError::NotJoined("public".into()));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "sys");
        assert_eq!(value["sys"]["kind"], "error");
        assert_eq!(value["sys"]["code"], 412);

        let back: ServerEnvelope = serde_json::from_value(value).unwrap();
        assert!(matches!(back.into_error(), Some(MurmurError::NotJoined(_))));
    }

    #[test]
    fn page_uses_camel_case_counts() {
        let env = ServerEnvelope::ChannelMessages {
            channel_messages: MessagePage {
                channel: PUBLIC_CHANNEL.into(),
                offset: 0,
                limit: 10,
                messages: vec![],
                messages_total: 3,
                messages_received: 0,
            },
        };
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["channelMessages"]["messagesTotal"], 3);
        assert_eq!(value["channelMessages"]["messagesReceived"], 0);
    }

    #[test]
    fn sys_join_fields_are_camel_case() {
        let env = ServerEnvelope::Sys {
            sys: SysEvent::ChannelJoin {
                channel: "c".into(),
                user_id: "u1".into(),
                username: "alice".into(),
            },
        };
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["sys"]["kind"], "channelJoin");
        assert_eq!(value["sys"]["userId"], "u1");
    }
}
