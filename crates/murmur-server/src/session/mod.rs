//! Per-connection session state.
//!
//! A session moves `Connected → Authenticating → Authenticated` and ends in
//! `Terminated`. Orthogonally it holds the set of joined channels, each with
//! a forwarder task that copies channel events into the session's outbound
//! queue. Every forwarder runs under a child of the session's cancellation
//! token, so terminating the session stops all of them.

pub mod multiplexer;

use crate::channel::ChannelEvent;
use crate::store::Subscription;
use murmur_core::{MurmurError, MurmurResult, ServerEnvelope};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The user a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Connected,
    Authenticating,
    Authenticated(UserIdentity),
    Terminated,
}

struct JoinedChannel {
    recipient: String,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

pub struct Session {
    id: String,
    remote: SocketAddr,
    phase: SessionPhase,
    joined: HashMap<String, JoinedChannel>,
    outbox: mpsc::Sender<ServerEnvelope>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(remote: SocketAddr, outbox: mpsc::Sender<ServerEnvelope>) -> Self {
        Self {
            id: generate_session_id(),
            remote,
            phase: SessionPhase::Connected,
            joined: HashMap::new(),
            outbox,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    /// The bound user, once authenticated.
    pub fn user(&self) -> Option<&UserIdentity> {
        match &self.phase {
            SessionPhase::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    /// The bound user, or `Unauthorized`.
    pub fn require_user(&self) -> MurmurResult<&UserIdentity> {
        self.user()
            .ok_or_else(|| MurmurError::Unauthorized("sign in first".into()))
    }

    /// Enter `Authenticating`. A session is bound at most once.
    pub fn begin_auth(&mut self) -> MurmurResult<()> {
        match self.phase {
            SessionPhase::Connected => {
                self.phase = SessionPhase::Authenticating;
                Ok(())
            }
            SessionPhase::Authenticated(_) => Err(MurmurError::InvalidArgument(
                "session is already signed in".into(),
            )),
            _ => Err(MurmurError::InvalidArgument(
                "session cannot authenticate now".into(),
            )),
        }
    }

    /// Back to `Connected` after a failed sign-up or sign-in.
    pub fn fail_auth(&mut self) {
        if self.phase == SessionPhase::Authenticating {
            self.phase = SessionPhase::Connected;
        }
    }

    pub fn bind(&mut self, user: UserIdentity) {
        debug!(session_id = %self.id, user_id = %user.user_id, "session bound");
        self.phase = SessionPhase::Authenticated(user);
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.joined.contains_key(channel)
    }

    /// Register a channel and start forwarding its events to this session.
    pub fn attach(&mut self, channel: String, recipient: String, subscription: Subscription) {
        let cancel = self.cancel.child_token();
        let forwarder = spawn_forwarder(
            self.id.clone(),
            channel.clone(),
            subscription,
            self.outbox.clone(),
            cancel.clone(),
        );
        if let Some(previous) = self.joined.insert(
            channel,
            JoinedChannel {
                recipient,
                cancel,
                forwarder,
            },
        ) {
            previous.cancel.cancel();
        }
    }

    /// Stop forwarding `channel`. Returns `false` if it was not joined.
    pub fn detach(&mut self, channel: &str) -> bool {
        match self.joined.remove(channel) {
            Some(joined) => {
                joined.cancel.cancel();
                debug!(session_id = %self.id, channel, recipient = %joined.recipient, "channel detached");
                true
            }
            None => false,
        }
    }

    /// Cancel every forwarder, wait for them to stop and enter `Terminated`.
    /// Returns the channels that were joined and the user the session was
    /// bound to.
    pub async fn terminate(&mut self) -> (Vec<String>, Option<UserIdentity>) {
        self.cancel.cancel();
        let mut channels = Vec::with_capacity(self.joined.len());
        for (channel, joined) in self.joined.drain() {
            if let Err(e) = joined.forwarder.await {
                warn!(session_id = %self.id, channel = %channel, error = %e, "forwarder task failed");
            }
            channels.push(channel);
        }
        let user = match std::mem::replace(&mut self.phase, SessionPhase::Terminated) {
            SessionPhase::Authenticated(user) => Some(user),
            _ => None,
        };
        (channels, user)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Copy events from a channel subscription into the session's outbound
/// queue until cancelled. Events this session produced itself are skipped;
/// the session already answered its own request directly.
fn spawn_forwarder(
    session_id: String,
    channel: String,
    mut subscription: Subscription,
    outbox: mpsc::Sender<ServerEnvelope>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                payload = subscription.recv() => {
                    let Some(payload) = payload else {
                        warn!(session_id = %session_id, channel = %channel, "channel subscription closed");
                        break;
                    };
                    let event = match ChannelEvent::decode(&payload) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "dropping malformed channel event");
                            continue;
                        }
                    };
                    if event.origin == session_id {
                        continue;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = outbox.send(event.envelope) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!(session_id = %session_id, channel = %channel, "forwarder stopped");
    })
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
