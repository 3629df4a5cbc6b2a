//! The murmur chat client.
//!
//! Requests are answered in order, so a request is matched with the first
//! envelope that looks like its reply, or with the first `sys` error. Pushes
//! that arrive in between (messages from peers, join/leave notices) are kept
//! and handed out by [`ChatClient::next_event`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time;

use murmur_core::envelope::{
    ChannelJoinRequest, ChannelJoined, ChannelLeaveRequest, ChannelLeft, ChannelMessageRequest,
    ChannelMessagesRequest, SignInRequest, SignUpRequest,
};
use murmur_core::{
    Authorized, ChatMessage, ClientEnvelope, MessagePage, MurmurError, MurmurResult,
    ServerEnvelope, SysEvent, UserList,
};

use crate::connection::Connection;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ChatClient {
    conn: Connection,
    pending: VecDeque<ServerEnvelope>,
    user: Option<Authorized>,
    timeout: Duration,
}

impl ChatClient {
    /// Connect to a murmur server, e.g. `ws://127.0.0.1:8080`.
    pub async fn connect(url: &str) -> MurmurResult<Self> {
        Ok(Self {
            conn: Connection::connect(url).await?,
            pending: VecDeque::new(),
            user: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// How long a request waits for its reply.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The identity returned by the last successful sign-up or sign-in.
    pub fn user(&self) -> Option<&Authorized> {
        self.user.as_ref()
    }

    pub async fn sign_up(&mut self, username: &str, password: &str) -> MurmurResult<Authorized> {
        let req = ClientEnvelope::SignUp {
            sign_up: SignUpRequest {
                username: username.into(),
                password: password.into(),
            },
        };
        self.authorize(req).await
    }

    pub async fn sign_in(&mut self, username: &str, password: &str) -> MurmurResult<Authorized> {
        let req = ClientEnvelope::SignIn {
            sign_in: SignInRequest {
                username: username.into(),
                password: Some(password.into()),
                access_key: None,
            },
        };
        self.authorize(req).await
    }

    pub async fn sign_in_with_key(
        &mut self,
        username: &str,
        access_key: &str,
    ) -> MurmurResult<Authorized> {
        let req = ClientEnvelope::SignIn {
            sign_in: SignInRequest {
                username: username.into(),
                password: None,
                access_key: Some(access_key.into()),
            },
        };
        self.authorize(req).await
    }

    async fn authorize(&mut self, req: ClientEnvelope) -> MurmurResult<Authorized> {
        match self
            .request(req, |e| matches!(e, ServerEnvelope::Authorized { .. }))
            .await?
        {
            ServerEnvelope::Authorized { authorized } => {
                self.user = Some(authorized.clone());
                Ok(authorized)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Join the private channel with `recipient`, or the public channel.
    pub async fn join(&mut self, recipient: Option<&str>) -> MurmurResult<ChannelJoined> {
        let req = ClientEnvelope::ChannelJoin {
            channel_join: ChannelJoinRequest {
                recipient: recipient.map(str::to_string),
            },
        };
        match self
            .request(req, |e| matches!(e, ServerEnvelope::ChannelJoin { .. }))
            .await?
        {
            ServerEnvelope::ChannelJoin { channel_join } => Ok(channel_join),
            other => Err(unexpected(other)),
        }
    }

    /// Leave a joined channel by ID.
    pub async fn leave(&mut self, channel: &str) -> MurmurResult<ChannelLeft> {
        let req = ClientEnvelope::ChannelLeave {
            channel_leave: ChannelLeaveRequest {
                channel: Some(channel.into()),
                recipient: None,
            },
        };
        match self
            .request(req, |e| matches!(e, ServerEnvelope::ChannelLeave { .. }))
            .await?
        {
            ServerEnvelope::ChannelLeave { channel_leave } => Ok(channel_leave),
            other => Err(unexpected(other)),
        }
    }

    /// Send `text` to `recipient`, or to the public channel. Returns the
    /// stored message.
    pub async fn send_message(
        &mut self,
        recipient: Option<&str>,
        text: &str,
    ) -> MurmurResult<ChatMessage> {
        let me = self.user.as_ref().map(|u| u.user_id.clone()).unwrap_or_default();
        let req = ClientEnvelope::ChannelMessage {
            channel_message: ChannelMessageRequest {
                recipient: recipient.map(str::to_string),
                text: text.into(),
            },
        };
        let expected = text.to_string();
        match self
            .request(req, move |e| {
                matches!(e, ServerEnvelope::ChannelMessage { channel_message }
                    if channel_message.sender == me && channel_message.text == expected)
            })
            .await?
        {
            ServerEnvelope::ChannelMessage { channel_message } => Ok(channel_message),
            other => Err(unexpected(other)),
        }
    }

    /// One page of history, newest first.
    pub async fn history(
        &mut self,
        recipient: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> MurmurResult<MessagePage> {
        let req = ClientEnvelope::ChannelMessages {
            channel_messages: ChannelMessagesRequest {
                recipient: recipient.map(str::to_string),
                offset,
                limit,
            },
        };
        match self
            .request(req, |e| matches!(e, ServerEnvelope::ChannelMessages { .. }))
            .await?
        {
            ServerEnvelope::ChannelMessages { channel_messages } => Ok(channel_messages),
            other => Err(unexpected(other)),
        }
    }

    pub async fn users(&mut self) -> MurmurResult<UserList> {
        match self
            .request(ClientEnvelope::Users, |e| {
                matches!(e, ServerEnvelope::Users { .. })
            })
            .await?
        {
            ServerEnvelope::Users { users } => Ok(users),
            other => Err(unexpected(other)),
        }
    }

    /// Send a raw text frame and wait for the `sys` error it provokes.
    pub async fn send_raw_expect_error(&mut self, text: &str) -> MurmurResult<MurmurError> {
        self.conn.send_text(text.to_string()).await?;
        match self.wait_for(|_| false).await {
            Err(e) => Ok(e),
            Ok(other) => Err(unexpected(other)),
        }
    }

    /// Next pushed envelope, or `None` if nothing arrives within `timeout`.
    pub async fn next_event(&mut self, timeout: Duration) -> MurmurResult<Option<ServerEnvelope>> {
        if let Some(envelope) = self.pending.pop_front() {
            return Ok(Some(envelope));
        }
        match time::timeout(timeout, self.conn.recv()).await {
            Ok(Some(envelope)) => Ok(Some(envelope)),
            Ok(None) => Err(MurmurError::Transport("connection closed".into())),
            Err(_) => Ok(None),
        }
    }

    /// Wait for the next pushed chat message, skipping other events.
    pub async fn next_message(&mut self, timeout: Duration) -> MurmurResult<ChatMessage> {
        let deadline = time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            match self.next_event(remaining).await? {
                Some(ServerEnvelope::ChannelMessage { channel_message }) => {
                    return Ok(channel_message)
                }
                Some(_) => continue,
                None => return Err(MurmurError::Timeout),
            }
        }
    }

    /// Wait for the next `sys` event, skipping other pushes.
    pub async fn next_sys(&mut self, timeout: Duration) -> MurmurResult<SysEvent> {
        let deadline = time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            match self.next_event(remaining).await? {
                Some(ServerEnvelope::Sys { sys }) => return Ok(sys),
                Some(_) => continue,
                None => return Err(MurmurError::Timeout),
            }
        }
    }

    pub async fn close(&self) -> MurmurResult<()> {
        self.conn.close().await
    }

    async fn request<F>(&mut self, req: ClientEnvelope, is_reply: F) -> MurmurResult<ServerEnvelope>
    where
        F: Fn(&ServerEnvelope) -> bool,
    {
        tracing::debug!(kind = req.kind(), "request");
        self.conn.send(&req).await?;
        self.wait_for(is_reply).await
    }

    /// Read until a reply (or a `sys` error) arrives, buffering anything else.
    async fn wait_for<F>(&mut self, is_reply: F) -> MurmurResult<ServerEnvelope>
    where
        F: Fn(&ServerEnvelope) -> bool,
    {
        let deadline = time::Instant::now() + self.timeout;
        loop {
            let envelope = match time::timeout_at(deadline, self.conn.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Err(MurmurError::Transport("connection closed".into())),
                Err(_) => return Err(MurmurError::Timeout),
            };
            if is_reply(&envelope) {
                return Ok(envelope);
            }
            if matches!(envelope, ServerEnvelope::Sys { sys: SysEvent::Error { .. } }) {
                if let Some(err) = envelope.into_error() {
                    return Err(err);
                }
                continue;
            }
            self.pending.push_back(envelope);
        }
    }
}

fn unexpected(envelope: ServerEnvelope) -> MurmurError {
    MurmurError::Other(format!("unexpected reply: {}", envelope.kind()))
}
