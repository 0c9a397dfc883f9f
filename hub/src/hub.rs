use crate::error::{self, Error};
use crate::frame::{CloseReason, Frame};
use crate::session::{SessionHandle, SessionId, UserId};
use events::Audience;
use log::*;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

enum Command {
    Register(SessionHandle),
    Unregister {
        id: SessionId,
        done: oneshot::Sender<()>,
    },
    Broadcast {
        audience: Audience,
        frame: Frame,
    },
    Connected(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the per-process connection hub.
///
/// All registry mutations travel through one bounded command queue and are
/// applied by a single task, so the registry needs no lock.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
}

impl Hub {
    /// Spawns the hub's command loop on the current runtime.
    pub fn spawn(command_capacity: usize) -> Self {
        let (commands, receiver) = mpsc::channel(command_capacity.max(1));
        let actor = HubActor {
            commands: receiver,
            registry: Registry::new(),
        };
        tokio::spawn(actor.run());
        Self { commands }
    }

    /// Adds a session. Registering an already-registered session is a no-op.
    pub async fn register(&self, session: SessionHandle) -> Result<(), Error> {
        self.commands
            .send(Command::Register(session))
            .await
            .map_err(|_| error::stopped())
    }

    /// Removes a session and waits until the hub applied the removal.
    /// Idempotent; a stopped hub has nothing left to remove.
    pub async fn unregister(&self, id: SessionId) {
        let (done, applied) = oneshot::channel();
        if self
            .commands
            .send(Command::Unregister { id, done })
            .await
            .is_ok()
        {
            let _ = applied.await;
        }
    }

    /// Queues a frame for every session in the audience.
    pub async fn broadcast(&self, audience: Audience, frame: Frame) -> Result<(), Error> {
        self.commands
            .send(Command::Broadcast { audience, frame })
            .await
            .map_err(|_| error::stopped())
    }

    /// Number of currently registered sessions.
    pub async fn connected(&self) -> Result<usize, Error> {
        let (reply, count) = oneshot::channel();
        self.commands
            .send(Command::Connected(reply))
            .await
            .map_err(|_| error::stopped())?;
        count.await.map_err(|_| error::stopped())
    }

    /// Stops accepting commands, applies the ones already queued, then closes
    /// every session with a going-away reason.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).await.is_ok() {
            let _ = finished.await;
        }
    }
}

/// Registry with dual indices so targeted broadcasts do not scan every session.
struct Registry {
    sessions: HashMap<SessionId, SessionHandle>,
    user_index: HashMap<UserId, HashSet<SessionId>>,
    channel_index: HashMap<String, HashSet<SessionId>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            user_index: HashMap::new(),
            channel_index: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn insert(&mut self, session: SessionHandle) -> bool {
        if self.sessions.contains_key(session.id()) || !session.state().is_open() {
            return false;
        }

        let id = session.id().clone();
        let identity = session.identity();
        self.user_index
            .entry(identity.user_id.clone())
            .or_default()
            .insert(id.clone());
        for scope in &identity.scopes {
            self.channel_index
                .entry(scope.clone())
                .or_default()
                .insert(id.clone());
        }
        self.sessions.insert(id, session);
        true
    }

    fn remove(&mut self, id: &SessionId) -> Option<SessionHandle> {
        let session = self.sessions.remove(id)?;
        let identity = session.identity();

        if let Some(ids) = self.user_index.get_mut(&identity.user_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.user_index.remove(&identity.user_id);
            }
        }
        for scope in &identity.scopes {
            if let Some(ids) = self.channel_index.get_mut(scope) {
                ids.remove(id);
                if ids.is_empty() {
                    self.channel_index.remove(scope);
                }
            }
        }
        Some(session)
    }

    /// Sessions the audience matches. The indices narrow the candidates; the
    /// audience itself has the final say.
    fn targets(&self, audience: &Audience) -> Vec<SessionId> {
        let candidates: Box<dyn Iterator<Item = &SessionId> + '_> = match audience {
            Audience::Channel { name } => match self.channel_index.get(name) {
                Some(ids) => Box::new(ids.iter()),
                None => return Vec::new(),
            },
            Audience::User { user_id } => match self.user_index.get(user_id) {
                Some(ids) => Box::new(ids.iter()),
                None => return Vec::new(),
            },
            Audience::Broadcast => Box::new(self.sessions.keys()),
        };

        candidates
            .filter(|id| {
                self.sessions.get(*id).is_some_and(|session| {
                    let identity = session.identity();
                    audience.matches(&identity.user_id, &identity.scopes)
                })
            })
            .cloned()
            .collect()
    }

    fn drain(&mut self) -> Vec<SessionHandle> {
        self.user_index.clear();
        self.channel_index.clear();
        self.sessions.drain().map(|(_, session)| session).collect()
    }
}

struct HubActor {
    commands: mpsc::Receiver<Command>,
    registry: Registry,
}

impl HubActor {
    async fn run(mut self) {
        debug!("Hub command loop started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Shutdown(done) => {
                    self.shutdown(vec![done]).await;
                    return;
                }
                command => self.apply(command),
            }
        }

        // Every Hub handle was dropped.
        self.close_all(CloseReason::GoingAway);
        debug!("Hub command loop finished");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register(session) => {
                let id = session.id().clone();
                if self.registry.insert(session) {
                    debug!(
                        "Registered session {id} ({} connected)",
                        self.registry.len()
                    );
                } else {
                    trace!("Ignoring registration of session {id}");
                }
            }
            Command::Unregister { id, done } => {
                if self.registry.remove(&id).is_some() {
                    debug!(
                        "Unregistered session {id} ({} connected)",
                        self.registry.len()
                    );
                }
                let _ = done.send(());
            }
            Command::Broadcast { audience, frame } => self.broadcast(&audience, frame),
            Command::Connected(reply) => {
                let _ = reply.send(self.registry.len());
            }
            // Handled by `run` and `shutdown`.
            Command::Shutdown(_) => {}
        }
    }

    fn broadcast(&mut self, audience: &Audience, frame: Frame) {
        let targets = self.registry.targets(audience);
        let mut delivered = 0;

        for id in targets {
            let Some(session) = self.registry.sessions.get(&id) else {
                continue;
            };

            if !session.state().is_open() {
                self.registry.remove(&id);
                continue;
            }

            match session.try_deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Session {id} outbound buffer full, evicting user {}",
                        session.identity().user_id
                    );
                    session.begin_close(CloseReason::BufferOverflow);
                    self.registry.remove(&id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Session {id} stopped reading, removing");
                    self.registry.remove(&id);
                }
            }
        }

        trace!(
            "Broadcast {} frame to {delivered} session(s) for {audience}",
            frame.frame_type()
        );
    }

    async fn shutdown(&mut self, mut waiters: Vec<oneshot::Sender<()>>) {
        info!(
            "Hub shutting down with {} connected session(s)",
            self.registry.len()
        );

        // Apply whatever was queued before the shutdown request.
        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Shutdown(done) => waiters.push(done),
                command => self.apply(command),
            }
        }

        self.close_all(CloseReason::GoingAway);
        for done in waiters {
            let _ = done.send(());
        }
    }

    fn close_all(&mut self, reason: CloseReason) {
        for session in self.registry.drain() {
            session.begin_close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Identity, Session, SessionConfig, SessionState};
    use futures::channel::mpsc as client;
    use futures::StreamExt;
    use serde_json::json;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::{self, Instant};

    struct TestClient {
        handle: SessionHandle,
        task: JoinHandle<CloseReason>,
        _inbound: client::UnboundedSender<Result<Frame, Infallible>>,
        frames: client::UnboundedReceiver<Frame>,
    }

    fn connect(hub: &Hub, user: &str, scopes: &[&str], config: SessionConfig) -> TestClient {
        let session = Session::new(Identity::new(user, scopes.iter().copied()), config);
        let handle = session.handle();
        let (inbound_tx, inbound) = client::unbounded();
        let (outbound, frames) = client::unbounded();
        let hub = hub.clone();
        let task = tokio::spawn(async move { session.run(&hub, inbound, outbound).await });

        TestClient {
            handle,
            task,
            _inbound: inbound_tx,
            frames,
        }
    }

    async fn wait_for_connected(hub: &Hub, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while hub.connected().await.unwrap() != expected {
            assert!(Instant::now() < deadline, "hub never reached {expected} sessions");
            time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn event(topic: &str) -> Frame {
        Frame::Event {
            topic: topic.to_string(),
            payload: json!({"topic": topic}),
        }
    }

    #[test]
    fn targets_agree_with_audience_membership() {
        let identities = [
            Identity::new("alice", ["org-42"]),
            Identity::new("alice", ["org-7"]),
            Identity::new("bob", ["org-42", "org-7"]),
            Identity::new("org-42", Vec::<String>::new()),
        ];
        let mut registry = Registry::new();
        let handles: Vec<SessionHandle> = identities
            .into_iter()
            .map(|identity| Session::new(identity, SessionConfig::default()).handle())
            .collect();
        for handle in &handles {
            assert!(registry.insert(handle.clone()));
        }

        let audiences = [
            Audience::channel("org-42"),
            Audience::channel("org-7"),
            Audience::channel("org-99"),
            Audience::user("alice"),
            Audience::user("org-42"),
            Audience::Broadcast,
        ];
        for audience in audiences {
            let mut targets = registry.targets(&audience);
            targets.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            let mut expected: Vec<SessionId> = handles
                .iter()
                .filter(|h| audience.matches(&h.identity().user_id, &h.identity().scopes))
                .map(|h| h.id().clone())
                .collect();
            expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            assert_eq!(targets, expected, "{audience}");
        }
        assert_eq!(registry.targets(&Audience::channel("org-42")).len(), 2);
        assert_eq!(registry.targets(&Audience::user("org-42")).len(), 1);
    }

    #[tokio::test]
    async fn channel_broadcast_reaches_only_matching_sessions() {
        let hub = Hub::spawn(64);
        let mut a = connect(&hub, "alice", &["org-42"], SessionConfig::default());
        let mut b = connect(&hub, "bob", &["org-42", "org-7"], SessionConfig::default());
        let mut c = connect(&hub, "carol", &["org-99"], SessionConfig::default());
        wait_for_connected(&hub, 3).await;

        hub.broadcast(Audience::channel("org-42"), event("tasks"))
            .await
            .unwrap();

        assert_eq!(a.frames.next().await, Some(event("tasks")));
        assert_eq!(b.frames.next().await, Some(event("tasks")));
        // Commands are applied in order, so carol's queue is settled by now.
        hub.connected().await.unwrap();
        time::sleep(Duration::from_millis(20)).await;
        assert!(c.frames.try_next().is_err());
    }

    #[tokio::test]
    async fn user_broadcast_reaches_every_session_of_that_user() {
        let hub = Hub::spawn(64);
        let mut phone = connect(&hub, "alice", &[], SessionConfig::default());
        let mut laptop = connect(&hub, "alice", &[], SessionConfig::default());
        let mut other = connect(&hub, "bob", &[], SessionConfig::default());
        wait_for_connected(&hub, 3).await;

        hub.broadcast(Audience::user("alice"), event("direct"))
            .await
            .unwrap();

        assert_eq!(phone.frames.next().await, Some(event("direct")));
        assert_eq!(laptop.frames.next().await, Some(event("direct")));
        time::sleep(Duration::from_millis(20)).await;
        assert!(other.frames.try_next().is_err());
    }

    #[tokio::test]
    async fn register_is_idempotent_and_unregister_too() {
        let hub = Hub::spawn(16);
        let session = Session::new(Identity::new("alice", ["org-1"]), SessionConfig::default());
        let handle = session.handle();

        hub.register(handle.clone()).await.unwrap();
        hub.register(handle.clone()).await.unwrap();
        assert_eq!(hub.connected().await.unwrap(), 1);

        hub.unregister(handle.id().clone()).await;
        hub.unregister(handle.id().clone()).await;
        assert_eq!(hub.connected().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_sessions_are_never_registered() {
        let hub = Hub::spawn(16);
        let session = Session::new(Identity::new("alice", ["org-1"]), SessionConfig::default());
        let handle = session.handle();
        handle.begin_close(CloseReason::ClientDisconnect);

        hub.register(handle).await.unwrap();
        assert_eq!(hub.connected().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn registry_never_holds_closed_sessions_through_churn() {
        let hub = Hub::spawn(64);
        let mut clients = Vec::new();
        for n in 0..8 {
            clients.push(connect(&hub, &format!("user-{n}"), &["org-1"], SessionConfig::default()));
        }
        wait_for_connected(&hub, 8).await;

        // Half of the clients hang up.
        let mut remaining = Vec::new();
        for (n, client) in clients.into_iter().enumerate() {
            if n % 2 == 0 {
                let TestClient { task, _inbound, handle, .. } = client;
                _inbound.close_channel();
                assert_eq!(task.await.unwrap(), CloseReason::ClientDisconnect);
                assert!(handle.state().is_closed());
            } else {
                remaining.push(client);
            }
        }

        assert_eq!(hub.connected().await.unwrap(), 4);
        for client in &remaining {
            assert_eq!(client.handle.state(), SessionState::Active);
        }
    }

    #[tokio::test]
    async fn saturated_session_is_evicted_without_delaying_others() {
        let hub = Hub::spawn(64);
        let config = SessionConfig {
            outbound_capacity: 2,
            write_wait: Duration::from_millis(200),
            ..SessionConfig::default()
        };

        // Session C's client never reads: a zero-capacity channel blocks the writer.
        let slow = Session::new(Identity::new("carol", ["org-42"]), config.clone());
        let slow_handle = slow.handle();
        let (_slow_in, slow_inbound) = client::unbounded::<Result<Frame, Infallible>>();
        let (slow_outbound, _slow_frames) = client::channel::<Frame>(0);
        let slow_task = tokio::spawn({
            let hub = hub.clone();
            async move { slow.run(&hub, slow_inbound, slow_outbound).await }
        });

        let mut fast = connect(&hub, "alice", &["org-42"], SessionConfig::default());
        wait_for_connected(&hub, 2).await;

        let started = Instant::now();
        for n in 0..10 {
            hub.broadcast(Audience::channel("org-42"), event(&format!("e{n}")))
                .await
                .unwrap();
        }

        for n in 0..10 {
            assert_eq!(fast.frames.next().await, Some(event(&format!("e{n}"))));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let reason = time::timeout(Duration::from_secs(2), slow_task)
            .await
            .expect("slow session was not closed in time")
            .unwrap();
        assert_eq!(reason, CloseReason::BufferOverflow);
        assert_eq!(
            slow_handle.state(),
            SessionState::Closed(CloseReason::BufferOverflow)
        );
        assert_eq!(hub.connected().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_every_session_going_away() {
        let hub = Hub::spawn(64);
        let mut a = connect(&hub, "alice", &["org-1"], SessionConfig::default());
        let mut b = connect(&hub, "bob", &["org-2"], SessionConfig::default());
        wait_for_connected(&hub, 2).await;

        // Queued ahead of the shutdown, so it is still delivered.
        hub.broadcast(Audience::Broadcast, event("last")).await.unwrap();
        hub.shutdown().await;

        for client in [&mut a, &mut b] {
            assert_eq!(client.frames.next().await, Some(event("last")));
            assert_eq!(
                client.frames.next().await,
                Some(Frame::Close {
                    reason: CloseReason::GoingAway
                })
            );
        }
        assert_eq!(a.task.await.unwrap(), CloseReason::GoingAway);
        assert_eq!(b.task.await.unwrap(), CloseReason::GoingAway);

        assert!(hub.connected().await.is_err());
        assert!(hub
            .broadcast(Audience::Broadcast, event("late"))
            .await
            .is_err());
    }
}
