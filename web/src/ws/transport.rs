//! Maps WebSocket messages to session frames and back.

use axum::extract::ws::{CloseFrame, Message};
use futures::future::{ready, Ready};
use futures::{Sink, SinkExt, Stream, StreamExt};
use hub::{CloseReason, Frame};
use log::*;

/// Decodes one inbound message. `None` means the message carries nothing the
/// session needs to see.
pub(crate) fn decode(message: Result<Message, axum::Error>) -> Option<Result<Frame, axum::Error>> {
    let message = match message {
        Ok(message) => message,
        Err(e) => return Some(Err(e)),
    };

    match message {
        Message::Text(text) => match Frame::from_json(&text) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                debug!("Ignoring undecodable client frame: {e}");
                None
            }
        },
        // The protocol layer answers control pings on its own.
        Message::Ping(_) => None,
        Message::Pong(_) => Some(Ok(Frame::Pong)),
        Message::Binary(_) => {
            trace!("Ignoring binary client message");
            None
        }
        Message::Close(_) => Some(Ok(Frame::Close {
            reason: CloseReason::ClientDisconnect,
        })),
    }
}

/// Encodes one outbound frame.
///
/// Heartbeat pings and closes use control frames so that browser clients
/// answer them without application code; everything else is JSON text.
pub(crate) fn encode(frame: Frame) -> Result<Message, axum::Error> {
    match frame {
        Frame::Ping => Ok(Message::Ping(Vec::new())),
        Frame::Close { reason } => Ok(Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: reason.as_str().into(),
        }))),
        frame @ (Frame::Event { .. } | Frame::Pong) => {
            frame.to_json().map(Message::Text).map_err(axum::Error::new)
        }
    }
}

pub(crate) fn frames<S>(
    messages: S,
) -> impl Stream<Item = Result<Frame, axum::Error>> + Unpin
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    messages.filter_map(|message| ready(decode(message)))
}

pub(crate) fn frame_sink<S>(sink: S) -> impl Sink<Frame, Error = axum::Error> + Unpin
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    sink.with(|frame: Frame| -> Ready<Result<Message, axum::Error>> { ready(encode(frame)) })
}
