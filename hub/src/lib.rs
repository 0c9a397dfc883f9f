//! Per-process connection hub for live client sessions.
//!
//! This crate owns every live client connection of one relay process and is
//! the only component allowed to write to them.
//!
//! # Architecture
//!
//! - **Single-owner command loop**: `Hub` is a cloneable handle onto a bounded
//!   command queue. One task owns the registry and applies register, unregister
//!   and broadcast commands in order, so no lock guards the registry.
//! - **Dual-index registry**: sessions are indexed by user id and by audience
//!   scope, so channel- and user-targeted broadcasts only touch matching sessions.
//! - **Two loops per session**: a read loop tracks heartbeats and client
//!   disconnects, a write loop drains the bounded outbound queue and sends
//!   pings. They share only that queue and the liveness state.
//! - **Backpressure**: a broadcast never waits on a session. A session whose
//!   outbound queue is full is evicted and closed; everybody else keeps receiving.
//! - **Transport-agnostic**: sessions consume a `Stream` of decoded frames and
//!   write into a `Sink` of frames. The web layer adapts a WebSocket to both.
//!
//! # Session lifecycle
//!
//! `Connecting → Active → Closing → Closed`. Heartbeat timeout, buffer
//! overflow, client disconnect and server shutdown all lead to Closing; a
//! session is only marked Closed after the hub confirmed it was removed, so the
//! registry never contains a Closed session.
//!
//! # Modules
//!
//! - `frame`: wire frames and close reasons
//! - `hub`: the command loop and registry
//! - `session`: session state, heartbeat and write loops

pub mod error;
pub mod frame;
pub mod hub;
pub mod session;

pub use error::Error;
pub use frame::{CloseReason, Frame};
pub use hub::Hub;
pub use session::{Identity, Session, SessionConfig, SessionHandle, SessionId, SessionState};
