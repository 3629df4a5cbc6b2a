//! Message controller: turns one inbound envelope into zero or more replies.
//!
//! The controller holds no per-connection state of its own; everything it
//! changes on a connection goes through the [`Session`] it is handed. Errors
//! are returned to the caller, which reports them to the offending session
//! only.

use crate::auth::RateLimiter;
use crate::channel::{resolve_channel, ChannelDirectory};
use crate::presence::Presence;
use crate::session::{Session, UserIdentity};
use crate::users::UserRegistry;
use chrono::Utc;
use murmur_core::envelope::{
    ChannelJoinRequest, ChannelJoined, ChannelLeaveRequest, ChannelLeft, ChannelMessageRequest,
    ChannelMessagesRequest, SignInRequest, SignUpRequest,
};
use murmur_core::{
    Authorized, ChatMessage, ClientEnvelope, MessagePage, MurmurError, MurmurResult,
    ServerEnvelope, SysEvent, UserList, PUBLIC_CHANNEL,
};
use tracing::{debug, info, warn};

pub struct Controller {
    channels: ChannelDirectory,
    presence: Presence,
    users: UserRegistry,
    auth_limiter: RateLimiter,
    max_message_chars: usize,
}

impl Controller {
    pub fn new(
        channels: ChannelDirectory,
        presence: Presence,
        users: UserRegistry,
        auth_limiter: RateLimiter,
        max_message_chars: usize,
    ) -> Self {
        Self {
            channels,
            presence,
            users,
            auth_limiter,
            max_message_chars,
        }
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn auth_limiter(&self) -> &RateLimiter {
        &self.auth_limiter
    }

    /// Dispatch one request.
    pub async fn handle(
        &self,
        session: &mut Session,
        request: ClientEnvelope,
    ) -> MurmurResult<Vec<ServerEnvelope>> {
        if !request.is_auth_request() {
            session.require_user()?;
        }

        let reply = match request {
            ClientEnvelope::SignUp { sign_up } => self.sign_up(session, sign_up).await?,
            ClientEnvelope::SignIn { sign_in } => self.sign_in(session, sign_in).await?,
            ClientEnvelope::ChannelJoin { channel_join } => {
                self.channel_join(session, channel_join).await?
            }
            ClientEnvelope::ChannelLeave { channel_leave } => {
                self.channel_leave(session, channel_leave).await?
            }
            ClientEnvelope::ChannelMessage { channel_message } => {
                self.channel_message(session, channel_message).await?
            }
            ClientEnvelope::ChannelMessages { channel_messages } => {
                self.channel_messages(session, channel_messages).await?
            }
            ClientEnvelope::Users => self.list_users().await?,
        };
        Ok(vec![reply])
    }

    // ── authentication ─────────────────────────────────────────────────

    async fn sign_up(
        &self,
        session: &mut Session,
        req: SignUpRequest,
    ) -> MurmurResult<ServerEnvelope> {
        session.begin_auth()?;
        let result = match self.check_auth_budget(session) {
            Ok(()) => self.users.create(&req.username, &req.password).await,
            Err(e) => Err(e),
        };
        let authorized = self.finish_auth(session, result).await?;
        info!(session_id = %session.id(), user_id = %authorized.user_id, "signed up");
        Ok(ServerEnvelope::Authorized { authorized })
    }

    async fn sign_in(
        &self,
        session: &mut Session,
        req: SignInRequest,
    ) -> MurmurResult<ServerEnvelope> {
        session.begin_auth()?;
        let result = match self.check_auth_budget(session) {
            Ok(()) => match (req.password.as_deref(), req.access_key.as_deref()) {
                (Some(password), _) => self.users.authenticate(&req.username, password).await,
                (None, Some(key)) => self.users.authenticate_with_key(&req.username, key).await,
                (None, None) => Err(MurmurError::InvalidArgument(
                    "password or accessKey is required".into(),
                )),
            },
            Err(e) => Err(e),
        };
        let authorized = self.finish_auth(session, result).await?;
        info!(session_id = %session.id(), user_id = %authorized.user_id, "signed in");

        let event = SysEvent::SignIn {
            user_id: authorized.user_id.clone(),
            username: authorized.username.clone(),
        };
        self.announce(PUBLIC_CHANNEL, session.id(), event).await;
        Ok(ServerEnvelope::Authorized { authorized })
    }

    /// Sign-up and sign-in attempts share one budget per remote IP.
    fn check_auth_budget(&self, session: &Session) -> MurmurResult<()> {
        if self.auth_limiter.check_and_record(session.remote().ip()) {
            Ok(())
        } else {
            Err(MurmurError::RateLimited("too many sign-in attempts".into()))
        }
    }

    /// Bind the session and mark the user online, or roll back to `Connected`.
    async fn finish_auth(
        &self,
        session: &mut Session,
        result: MurmurResult<Authorized>,
    ) -> MurmurResult<Authorized> {
        let authorized = match result {
            Ok(authorized) => authorized,
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "authentication failed");
                session.fail_auth();
                return Err(e);
            }
        };
        if let Err(e) = self
            .presence
            .mark_online(&authorized.user_id, session.id())
            .await
        {
            session.fail_auth();
            return Err(e);
        }
        session.bind(UserIdentity {
            user_id: authorized.user_id.clone(),
            username: authorized.username.clone(),
        });
        Ok(authorized)
    }

    // ── channels ───────────────────────────────────────────────────────

    async fn channel_join(
        &self,
        session: &mut Session,
        req: ChannelJoinRequest,
    ) -> MurmurResult<ServerEnvelope> {
        let user = session.require_user()?.clone();
        let recipient = req.recipient.unwrap_or_default();
        let channel = resolve_channel(&user.user_id, &recipient);

        if !session.is_joined(&channel) {
            let subscription = self.channels.join(&channel).await?;
            session.attach(channel.clone(), recipient.clone(), subscription);
            info!(session_id = %session.id(), channel = %channel, "joined channel");

            let event = SysEvent::ChannelJoin {
                channel: channel.clone(),
                user_id: user.user_id,
                username: user.username,
            };
            self.announce(&channel, session.id(), event).await;
        }

        Ok(ServerEnvelope::ChannelJoin {
            channel_join: ChannelJoined { channel, recipient },
        })
    }

    async fn channel_leave(
        &self,
        session: &mut Session,
        req: ChannelLeaveRequest,
    ) -> MurmurResult<ServerEnvelope> {
        let user = session.require_user()?.clone();
        let channel = match (req.channel, req.recipient) {
            (Some(channel), _) if !channel.is_empty() => channel,
            (_, recipient) => resolve_channel(&user.user_id, &recipient.unwrap_or_default()),
        };

        if !session.detach(&channel) {
            return Err(MurmurError::NotJoined(channel));
        }
        info!(session_id = %session.id(), channel = %channel, "left channel");

        let event = SysEvent::ChannelLeave {
            channel: channel.clone(),
            user_id: user.user_id,
            username: user.username,
        };
        self.announce(&channel, session.id(), event).await;

        Ok(ServerEnvelope::ChannelLeave {
            channel_leave: ChannelLeft { channel },
        })
    }

    async fn channel_message(
        &self,
        session: &mut Session,
        req: ChannelMessageRequest,
    ) -> MurmurResult<ServerEnvelope> {
        let user = session.require_user()?.clone();
        if req.text.trim().is_empty() {
            return Err(MurmurError::InvalidArgument("message text is empty".into()));
        }
        let chars = req.text.chars().count();
        if chars > self.max_message_chars {
            return Err(MurmurError::InvalidArgument(format!(
                "message text is {chars} characters (max {})",
                self.max_message_chars
            )));
        }

        let recipient = req.recipient.unwrap_or_default();
        let channel = resolve_channel(&user.user_id, &recipient);

        // Sending on a channel subscribes the sender to it.
        if !session.is_joined(&channel) {
            let subscription = self.channels.join(&channel).await?;
            session.attach(channel.clone(), recipient.clone(), subscription);
            debug!(session_id = %session.id(), channel = %channel, "auto-joined on send");
        }

        let message = ChatMessage {
            id: generate_message_id(),
            sender: user.user_id,
            recipient,
            text: req.text,
            created_at: Utc::now(),
        };
        self.channels.publish(&message, session.id()).await?;

        Ok(ServerEnvelope::ChannelMessage {
            channel_message: message,
        })
    }

    async fn channel_messages(
        &self,
        session: &mut Session,
        req: ChannelMessagesRequest,
    ) -> MurmurResult<ServerEnvelope> {
        let user = session.require_user()?;
        let channel = resolve_channel(&user.user_id, req.recipient.as_deref().unwrap_or(""));
        if !session.is_joined(&channel) {
            return Err(MurmurError::NotJoined(channel));
        }

        let (messages, total) = self
            .channels
            .history(&channel, req.offset, req.limit)
            .await?;

        Ok(ServerEnvelope::ChannelMessages {
            channel_messages: MessagePage {
                channel,
                offset: req.offset,
                limit: self.channels.page_limit(req.limit),
                messages_received: messages.len(),
                messages,
                messages_total: total,
            },
        })
    }

    async fn list_users(&self) -> MurmurResult<ServerEnvelope> {
        let users = self.users.list_all().await?;
        Ok(ServerEnvelope::Users {
            users: UserList {
                total: users.len(),
                received: users.len(),
                users,
            },
        })
    }

    // ── session lifecycle ──────────────────────────────────────────────

    /// Heartbeat: keep the session's presence marker alive.
    pub async fn heartbeat(&self, session: &Session) {
        if let Some(user) = session.user() {
            if let Err(e) = self.presence.mark_online(&user.user_id, session.id()).await {
                warn!(session_id = %session.id(), error = %e, "presence refresh failed");
            }
        }
    }

    /// Tear down a closed session: stop forwarders, tell channel members the
    /// user left and release presence.
    pub async fn disconnect(&self, session: &mut Session) {
        let session_id = session.id().to_string();
        let (channels, user) = session.terminate().await;
        let Some(user) = user else {
            return;
        };

        for channel in channels {
            let event = SysEvent::ChannelLeave {
                channel: channel.clone(),
                user_id: user.user_id.clone(),
                username: user.username.clone(),
            };
            self.announce(&channel, &session_id, event).await;
        }

        if let Err(e) = self.presence.mark_offline(&user.user_id, &session_id).await {
            warn!(session_id = %session_id, error = %e, "failed to clear presence");
        }
    }

    /// Announcements are fire-and-forget; the request that triggered one has
    /// already succeeded.
    async fn announce(&self, channel: &str, origin: &str, event: SysEvent) {
        if let Err(e) = self.channels.announce(channel, origin, event).await {
            warn!(channel, error = %e, "channel announcement failed");
        }
    }
}

/// Random message ID (hex-encoded, 16 bytes).
fn generate_message_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use murmur_core::ErrorKind;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn controller_with(store: Arc<dyn Store>, attempts: usize) -> Controller {
        let presence = Presence::new(store.clone(), Duration::from_secs(30));
        let users = UserRegistry::new(store.clone(), presence.clone(), b"secret".to_vec(), 3600);
        Controller::new(
            ChannelDirectory::new(store, 100),
            presence,
            users,
            RateLimiter::per_minute(attempts),
            16,
        )
    }

    fn controller() -> Controller {
        controller_with(Arc::new(MemoryStore::new()), 100)
    }

    fn session() -> (Session, mpsc::Receiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::channel(64);
        (Session::new("127.0.0.1:40000".parse().unwrap(), tx), rx)
    }

    fn sign_up(name: &str) -> ClientEnvelope {
        ClientEnvelope::SignUp {
            sign_up: SignUpRequest {
                username: name.into(),
                password: "pw".into(),
            },
        }
    }

    fn send(recipient: Option<&str>, text: &str) -> ClientEnvelope {
        ClientEnvelope::ChannelMessage {
            channel_message: ChannelMessageRequest {
                recipient: recipient.map(str::to_string),
                text: text.into(),
            },
        }
    }

    fn history() -> ClientEnvelope {
        ClientEnvelope::ChannelMessages {
            channel_messages: ChannelMessagesRequest::default(),
        }
    }

    async fn signed_up(ctl: &Controller, name: &str) -> (Session, mpsc::Receiver<ServerEnvelope>, String) {
        let (mut s, rx) = session();
        let reply = ctl.handle(&mut s, sign_up(name)).await.unwrap();
        let ServerEnvelope::Authorized { authorized } = &reply[0] else {
            panic!("expected authorized, got {reply:?}");
        };
        let id = authorized.user_id.clone();
        (s, rx, id)
    }

    #[tokio::test]
    async fn requests_before_auth_are_unauthorized() {
        let ctl = controller();
        let (mut s, _rx) = session();
        for req in [ClientEnvelope::Users, history(), send(None, "hi")] {
            let err = ctl.handle(&mut s, req).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unauthorized);
        }
    }

    #[tokio::test]
    async fn sign_up_binds_session_and_marks_online() {
        let ctl = controller();
        let (mut s, _rx, id) = signed_up(&ctl, "alice").await;
        assert_eq!(s.user().map(|u| u.user_id.as_str()), Some(id.as_str()));
        assert!(ctl.presence().is_online(&id).await.unwrap());

        let err = ctl.handle(&mut s, sign_up("alice2")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn failed_sign_in_leaves_session_unbound() {
        let ctl = controller();
        let _alice = signed_up(&ctl, "alice").await;

        let (mut s, _rx) = session();
        let req = ClientEnvelope::SignIn {
            sign_in: SignInRequest {
                username: "alice".into(),
                password: Some("wrong".into()),
                access_key: None,
            },
        };
        let err = ctl.handle(&mut s, req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCredential);
        assert!(s.user().is_none());

        let err = ctl.handle(&mut s, ClientEnvelope::Users).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn sign_in_requires_a_credential() {
        let ctl = controller();
        let (mut s, _rx) = session();
        let req = ClientEnvelope::SignIn {
            sign_in: SignInRequest {
                username: "alice".into(),
                ..Default::default()
            },
        };
        let err = ctl.handle(&mut s, req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn auth_attempts_are_rate_limited() {
        let ctl = controller_with(Arc::new(MemoryStore::new()), 1);
        let _alice = signed_up(&ctl, "alice").await;

        let (mut s, _rx) = session();
        let err = ctl.handle(&mut s, sign_up("bob")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn send_auto_joins_and_history_follows() {
        let ctl = controller();
        let (mut s, _rx, id) = signed_up(&ctl, "alice").await;

        let err = ctl.handle(&mut s, history()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotJoined);

        let reply = ctl.handle(&mut s, send(None, "hello")).await.unwrap();
        let ServerEnvelope::ChannelMessage { channel_message } = &reply[0] else {
            panic!("expected channelMessage, got {reply:?}");
        };
        assert_eq!(channel_message.sender, id);
        assert!(s.is_joined(PUBLIC_CHANNEL));

        let reply = ctl.handle(&mut s, history()).await.unwrap();
        let ServerEnvelope::ChannelMessages { channel_messages } = &reply[0] else {
            panic!("expected channelMessages, got {reply:?}");
        };
        assert_eq!(channel_messages.channel, PUBLIC_CHANNEL);
        assert_eq!(channel_messages.messages_total, 1);
        assert_eq!(channel_messages.messages_received, 1);
        assert_eq!(channel_messages.messages[0].text, "hello");
    }

    #[tokio::test]
    async fn message_text_is_validated() {
        let ctl = controller();
        let (mut s, _rx, _) = signed_up(&ctl, "alice").await;
        for text in ["", "   ", "this text is far too long"] {
            let err = ctl.handle(&mut s, send(None, text)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn join_is_idempotent_and_leave_requires_join() {
        let ctl = controller();
        let (mut s, _rx, _) = signed_up(&ctl, "alice").await;
        let join = ClientEnvelope::ChannelJoin {
            channel_join: ChannelJoinRequest { recipient: None },
        };
        let first = ctl.handle(&mut s, join.clone()).await.unwrap();
        let second = ctl.handle(&mut s, join).await.unwrap();
        assert_eq!(first[0].kind(), "channelJoin");
        assert_eq!(second[0].kind(), "channelJoin");

        let leave = ClientEnvelope::ChannelLeave {
            channel_leave: ChannelLeaveRequest {
                channel: Some(PUBLIC_CHANNEL.into()),
                recipient: None,
            },
        };
        ctl.handle(&mut s, leave.clone()).await.unwrap();
        let err = ctl.handle(&mut s, leave).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotJoined);
    }

    #[tokio::test]
    async fn private_channels_resolve_from_either_side() {
        let ctl = controller();
        let (mut alice, _ra, alice_id) = signed_up(&ctl, "alice").await;
        let (mut bob, _rb, bob_id) = signed_up(&ctl, "bob").await;

        ctl.handle(&mut alice, send(Some(&bob_id), "hi bob"))
            .await
            .unwrap();
        ctl.handle(
            &mut bob,
            ClientEnvelope::ChannelJoin {
                channel_join: ChannelJoinRequest {
                    recipient: Some(alice_id.clone()),
                },
            },
        )
        .await
        .unwrap();

        let reply = ctl
            .handle(
                &mut bob,
                ClientEnvelope::ChannelMessages {
                    channel_messages: ChannelMessagesRequest {
                        recipient: Some(alice_id),
                        offset: 0,
                        limit: 10,
                    },
                },
            )
            .await
            .unwrap();
        let ServerEnvelope::ChannelMessages { channel_messages } = &reply[0] else {
            panic!("expected channelMessages, got {reply:?}");
        };
        assert_eq!(channel_messages.channel, resolve_channel(&bob_id, &alice.user().unwrap().user_id));
        assert_eq!(channel_messages.messages[0].text, "hi bob");
    }

    #[tokio::test]
    async fn users_lists_presence() {
        let ctl = controller();
        let (mut alice, _ra, _) = signed_up(&ctl, "alice").await;
        let (mut bob, _rb, _) = signed_up(&ctl, "bob").await;
        ctl.disconnect(&mut bob).await;

        let reply = ctl.handle(&mut alice, ClientEnvelope::Users).await.unwrap();
        let ServerEnvelope::Users { users } = &reply[0] else {
            panic!("expected users, got {reply:?}");
        };
        assert_eq!(users.total, 2);
        assert_eq!(users.received, 2);
        assert!(users.users[0].online);
        assert!(!users.users[1].online);
    }

    #[tokio::test]
    async fn store_outage_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let ctl = controller_with(store.clone(), 100);
        let (mut s, _rx, _) = signed_up(&ctl, "alice").await;

        store.set_available(false);
        let err = ctl.handle(&mut s, send(None, "hello")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);

        store.set_available(true);
        ctl.handle(&mut s, send(None, "hello")).await.unwrap();
    }
}
