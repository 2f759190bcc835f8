use std::collections::HashMap;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::WebSocketError;
use crate::websocket::message::{Frame, Message, PresenceList};

/// What the registry does when a second session claims an identity that is already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Keep the live session and refuse the newcomer.
    #[default]
    Reject,
    /// Evict the live session and hand its identity to the newcomer.
    Replace,
}

/// Identity of one session as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub id: Uuid,
    pub user_id: String,
}

impl SessionRef {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
        }
    }
}

/// A registered session: its identity plus the producer side of its outbound queue.
///
/// The registry holds the only sender, so dropping the handle closes the queue.
#[derive(Debug)]
pub struct SessionHandle {
    pub session: SessionRef,
    outbound: mpsc::Sender<Frame>,
}

impl SessionHandle {
    pub fn new(session: SessionRef, outbound: mpsc::Sender<Frame>) -> Self {
        Self { session, outbound }
    }
}

#[derive(Debug)]
pub enum RegistryEvent {
    Register(SessionHandle),
    Unregister(SessionRef),
    Route(Message, SessionRef),
    Snapshot(oneshot::Sender<Vec<String>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    Rejected,
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// Target not connected. Signaling is fire-and-forget, so this is a no-op.
    Missed,
    /// Target queue was full or closed; the target was removed.
    Evicted,
    /// Origin is no longer the registered session for its identity.
    UnknownOrigin,
    Dropped,
}

/// Single owner of the live session map.
///
/// Every membership change and routing decision goes through one task that
/// owns this value, so the map needs no lock. Event handling never awaits:
/// deliveries use `try_send` and a session that cannot keep up is evicted.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<String, SessionHandle>,
    policy: CollisionPolicy,
}

impl Registry {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            sessions: HashMap::new(),
            policy,
        }
    }

    /// Move the registry onto its own task and return the intake handle.
    ///
    /// The task ends once every handle has been dropped.
    pub fn spawn(self, intake_capacity: usize) -> RegistryHandle {
        let (tx, rx) = mpsc::channel(intake_capacity);
        tokio::spawn(self.run(rx));
        RegistryHandle::new(tx)
    }

    async fn run(mut self, mut intake: mpsc::Receiver<RegistryEvent>) {
        info!(policy = ?self.policy, "Registry started");
        while let Some(event) = intake.recv().await {
            self.handle_event(event);
        }
        info!(sessions = self.sessions.len(), "Registry stopped");
    }

    pub fn handle_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Register(handle) => {
                self.register(handle);
            }
            RegistryEvent::Unregister(session) => {
                self.unregister(&session);
            }
            RegistryEvent::Route(message, origin) => {
                self.route(message, &origin);
            }
            RegistryEvent::Snapshot(reply) => {
                let _ = reply.send(self.user_ids());
            }
        }
    }

    pub fn register(&mut self, handle: SessionHandle) -> RegisterOutcome {
        let user_id = handle.session.user_id.clone();
        let outcome = match self.sessions.get(&user_id) {
            None => RegisterOutcome::Registered,
            Some(existing) => match self.policy {
                CollisionPolicy::Reject => {
                    warn!(
                        user_id = %user_id,
                        live_session = %existing.session.id,
                        refused_session = %handle.session.id,
                        "Identity already connected, refusing new session"
                    );
                    // Dropping the handle closes the newcomer's queue.
                    return RegisterOutcome::Rejected;
                }
                CollisionPolicy::Replace => {
                    warn!(
                        user_id = %user_id,
                        replaced_session = %existing.session.id,
                        new_session = %handle.session.id,
                        "Identity already connected, replacing live session"
                    );
                    RegisterOutcome::Replaced
                }
            },
        };

        info!(user_id = %user_id, session_id = %handle.session.id, "Session registered");
        // Any previous handle is dropped here, closing its queue.
        self.sessions.insert(user_id, handle);
        self.broadcast_presence();
        outcome
    }

    /// Remove `session` if it is still the registered holder of its identity.
    pub fn unregister(&mut self, session: &SessionRef) -> bool {
        if !self.is_current(session) {
            debug!(user_id = %session.user_id, session_id = %session.id, "Unregister for inactive session ignored");
            return false;
        }

        self.sessions.remove(&session.user_id);
        info!(user_id = %session.user_id, session_id = %session.id, "Session unregistered");
        self.broadcast_presence();
        true
    }

    pub fn route(&mut self, message: Message, origin: &SessionRef) -> RouteOutcome {
        if !self.is_current(origin) {
            debug!(user_id = %origin.user_id, session_id = %origin.id, "Dropping message from inactive session");
            return RouteOutcome::UnknownOrigin;
        }

        let target = message.target_user_id.clone();
        if !self.sessions.contains_key(&target) {
            debug!(from = %origin.user_id, to = %target, kind = %message.kind, "Route target not connected");
            return RouteOutcome::Missed;
        }

        let frame = match message.from_sender(&origin.user_id).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(from = %origin.user_id, to = %target, "Failed to serialize routed message: {}", e);
                return RouteOutcome::Dropped;
            }
        };

        if self.deliver(&target, frame) {
            debug!(from = %origin.user_id, to = %target, "Message routed");
            RouteOutcome::Delivered
        } else {
            self.broadcast_presence();
            RouteOutcome::Evicted
        }
    }

    /// Push the current identity list to every session.
    ///
    /// Evicting a session is itself a membership change, so the snapshot is
    /// re-sent to the survivors until a pass completes without eviction.
    fn broadcast_presence(&mut self) {
        loop {
            let targets = self.user_ids();
            let frame = match PresenceList::new(targets.clone()).to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to serialize presence list: {}", e);
                    return;
                }
            };

            let mut evicted = 0;
            for user_id in &targets {
                if !self.deliver(user_id, frame.clone()) {
                    evicted += 1;
                }
            }

            debug!(recipients = targets.len(), evicted, "Presence broadcast");
            if evicted == 0 {
                return;
            }
        }
    }

    /// Non-blocking enqueue. Returns `false` when the target had to be evicted.
    fn deliver(&mut self, user_id: &str, frame: Frame) -> bool {
        let Some(handle) = self.sessions.get(user_id) else {
            return true;
        };

        match handle.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %user_id, session_id = %handle.session.id, "Outbound queue full, evicting slow session");
                self.sessions.remove(user_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user_id = %user_id, session_id = %handle.session.id, "Outbound queue closed, evicting session");
                self.sessions.remove(user_id);
                false
            }
        }
    }

    fn is_current(&self, session: &SessionRef) -> bool {
        self.sessions
            .get(&session.user_id)
            .map(|handle| handle.session.id == session.id)
            .unwrap_or(false)
    }

    /// Connected identities, sorted.
    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Cloneable intake of a running [`Registry`].
///
/// Every call waits for intake capacity, which is how the registry applies
/// backpressure to a single busy client.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    intake: mpsc::Sender<RegistryEvent>,
}

impl RegistryHandle {
    pub(crate) fn new(intake: mpsc::Sender<RegistryEvent>) -> Self {
        Self { intake }
    }

    async fn submit(&self, event: RegistryEvent) -> Result<(), WebSocketError> {
        self.intake
            .send(event)
            .await
            .map_err(|_| WebSocketError::RegistryClosed)
    }

    pub async fn register(&self, handle: SessionHandle) -> Result<(), WebSocketError> {
        self.submit(RegistryEvent::Register(handle)).await
    }

    pub async fn unregister(&self, session: SessionRef) -> Result<(), WebSocketError> {
        self.submit(RegistryEvent::Unregister(session)).await
    }

    pub async fn route(&self, message: Message, origin: SessionRef) -> Result<(), WebSocketError> {
        self.submit(RegistryEvent::Route(message, origin)).await
    }

    pub async fn connected_users(&self) -> Result<Vec<String>, WebSocketError> {
        let (tx, rx) = oneshot::channel();
        self.submit(RegistryEvent::Snapshot(tx)).await?;
        rx.await.map_err(|_| WebSocketError::RegistryClosed)
    }
}
