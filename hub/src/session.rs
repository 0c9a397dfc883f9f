use crate::frame::{CloseReason, Frame};
use crate::hub::Hub;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::*;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Floor for the ping interval; tokio rejects a zero period.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

// Type alias for user IDs (the web layer hands over verified identities as strings)
pub type UserId = String;

/// Unique identifier for a session (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verified identity and audience scope, established before the session exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub scopes: HashSet<String>,
}

impl Identity {
    pub fn new<I, S>(user_id: impl Into<UserId>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }
}

/// Liveness state. Transitions only move forward: `Connecting → Active → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing(CloseReason),
    Closed(CloseReason),
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Connecting => 0,
            SessionState::Active => 1,
            SessionState::Closing(_) => 2,
            SessionState::Closed(_) => 3,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            SessionState::Closing(reason) | SessionState::Closed(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Heartbeat and backpressure settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for a liveness response before closing.
    pub pong_wait: Duration,
    /// Ping interval; must be shorter than `pong_wait`.
    pub ping_interval: Duration,
    /// Upper bound for a single outbound write.
    pub write_wait: Duration,
    /// Bounded outbound queue size. A broadcast that finds it full evicts the session.
    pub outbound_capacity: usize,
    /// Send a close frame to evicted (overflowed) clients before dropping them.
    pub notify_on_evict: bool,
}

impl SessionConfig {
    /// Derives the ping interval as 9/10 of `pong_wait` so one ping always fits before the deadline.
    pub fn with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_interval: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            outbound_capacity: 256,
            notify_on_evict: true,
        }
    }

    /// Whether a close frame is written to the client for this reason.
    pub fn announces(&self, reason: CloseReason) -> bool {
        match reason {
            CloseReason::ClientDisconnect | CloseReason::TransportError => false,
            CloseReason::BufferOverflow => self.notify_on_evict,
            CloseReason::HeartbeatTimeout | CloseReason::GoingAway => true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::with_pong_wait(Duration::from_secs(60))
    }
}

/// Cheap, cloneable reference to a session held by the Hub's registry.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    identity: Arc<Identity>,
    outbound: mpsc::Sender<Frame>,
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Non-blocking enqueue onto the bounded outbound queue.
    pub(crate) fn try_deliver(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.outbound.try_send(frame)
    }

    /// Moves the state forward; returns false when `next` would move it backwards or sideways.
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Starts teardown. The first caller's reason wins.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        self.transition(SessionState::Closing(reason))
    }

    fn mark_closed(&self) {
        self.state.send_if_modified(|current| match *current {
            SessionState::Closed(_) => false,
            SessionState::Closing(reason) => {
                *current = SessionState::Closed(reason);
                true
            }
            SessionState::Connecting | SessionState::Active => {
                *current = SessionState::Closed(CloseReason::ClientDisconnect);
                true
            }
        });
    }
}

/// One physical client connection: a read loop and a write loop that share
/// only the bounded outbound queue and the liveness state.
pub struct Session {
    handle: SessionHandle,
    queue: mpsc::Receiver<Frame>,
    config: SessionConfig,
}

impl Session {
    pub fn new(identity: Identity, config: SessionConfig) -> Self {
        let (outbound, queue) = mpsc::channel(config.outbound_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Connecting);

        Self {
            handle: SessionHandle {
                id: SessionId::new(),
                identity: Arc::new(identity),
                outbound,
                state: Arc::new(state),
            },
            queue,
            config,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Drives the session until it closes and returns the reason.
    ///
    /// `inbound` yields frames decoded from the client; `outbound` accepts frames
    /// to encode onto the connection. The session is registered with the hub on
    /// entry and is only marked Closed after the hub confirmed its removal.
    pub async fn run<I, O, E>(self, hub: &Hub, inbound: I, outbound: O) -> CloseReason
    where
        I: Stream<Item = Result<Frame, E>> + Unpin,
        O: Sink<Frame> + Unpin,
        O::Error: fmt::Display,
        E: fmt::Display,
    {
        let Session {
            handle,
            mut queue,
            config,
        } = self;

        handle.transition(SessionState::Active);

        match hub.register(handle.clone()).await {
            Ok(()) => {
                debug!(
                    "Session {} active for user {}",
                    handle.id(),
                    handle.identity().user_id
                );
                tokio::join!(
                    read_loop(&handle, inbound, &config),
                    write_loop(&handle, &mut queue, outbound, &config)
                );
                hub.unregister(handle.id().clone()).await;
            }
            Err(e) => {
                warn!("Session {} could not register: {e}", handle.id());
                handle.begin_close(CloseReason::GoingAway);
                write_loop(&handle, &mut queue, outbound, &config).await;
            }
        }

        handle.mark_closed();
        let reason = handle
            .state()
            .close_reason()
            .unwrap_or(CloseReason::ClientDisconnect);
        info!(
            "Session {} for user {} closed: {}",
            handle.id(),
            handle.identity().user_id,
            reason.as_str()
        );
        reason
    }
}

/// Resolves once the state has left Active.
async fn closing(state: &mut watch::Receiver<SessionState>) {
    loop {
        let open = state.borrow_and_update().is_open();
        if !open {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn read_loop<I, E>(handle: &SessionHandle, mut inbound: I, config: &SessionConfig)
where
    I: Stream<Item = Result<Frame, E>> + Unpin,
    E: fmt::Display,
{
    let mut state = handle.subscribe_state();
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        tokio::select! {
            biased;
            _ = closing(&mut state) => return,
            _ = time::sleep_until(deadline) => {
                debug!(
                    "Session {} sent no heartbeat response within {:?}",
                    handle.id(),
                    config.pong_wait
                );
                handle.begin_close(CloseReason::HeartbeatTimeout);
                return;
            }
            next = inbound.next() => match next {
                Some(Ok(Frame::Pong)) => deadline = Instant::now() + config.pong_wait,
                Some(Ok(Frame::Ping)) => {
                    if handle.try_deliver(Frame::Pong).is_err() {
                        trace!("Session {} dropped pong reply, queue full", handle.id());
                    }
                }
                Some(Ok(Frame::Close { .. })) | None => {
                    handle.begin_close(CloseReason::ClientDisconnect);
                    return;
                }
                Some(Ok(Frame::Event { topic, .. })) => {
                    debug!("Session {} ignoring client event frame on {topic}", handle.id());
                }
                Some(Err(e)) => {
                    debug!("Session {} read failed: {e}", handle.id());
                    handle.begin_close(CloseReason::TransportError);
                    return;
                }
            }
        }
    }
}

async fn write_loop<O>(
    handle: &SessionHandle,
    queue: &mut mpsc::Receiver<Frame>,
    mut outbound: O,
    config: &SessionConfig,
) where
    O: Sink<Frame> + Unpin,
    O::Error: fmt::Display,
{
    let mut state = handle.subscribe_state();
    let ping_interval = config.ping_interval.max(MIN_PING_INTERVAL);
    let mut ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            _ = closing(&mut state) => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => {
                    handle.begin_close(CloseReason::ClientDisconnect);
                    break;
                }
            },
            _ = ticker.tick() => Frame::Ping,
        };

        // An eviction must not wait behind a write to a stalled client.
        let written = tokio::select! {
            biased;
            _ = closing(&mut state) => break,
            written = time::timeout(config.write_wait, outbound.send(frame)) => written,
        };

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Session {} write failed: {e}", handle.id());
                handle.begin_close(CloseReason::TransportError);
                break;
            }
            Err(_) => {
                warn!(
                    "Session {} write did not complete within {:?}",
                    handle.id(),
                    config.write_wait
                );
                handle.begin_close(CloseReason::TransportError);
                break;
            }
        }
    }

    if let Some(reason) = handle.state().close_reason() {
        if reason == CloseReason::GoingAway {
            // Frames queued before shutdown are still worth a best-effort flush.
            while let Ok(frame) = queue.try_recv() {
                if !matches!(
                    time::timeout(config.write_wait, outbound.send(frame)).await,
                    Ok(Ok(()))
                ) {
                    break;
                }
            }
        }
        if config.announces(reason) {
            let farewell = Frame::Close { reason };
            if let Ok(Err(e)) = time::timeout(config.write_wait, outbound.send(farewell)).await {
                trace!("Session {} close frame not delivered: {e}", handle.id());
            }
        }
    }
    let _ = time::timeout(config.write_wait, outbound.close()).await;
}
