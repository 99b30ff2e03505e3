//! The HTTP boundary's only real job (§1, §6): adapt an axum websocket into
//! the `BoxedSink`/`BoxedStream` pair [`relay_core::SafeDuplexChannel`]
//! consumes. The core never learns it is talking to a websocket.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use relay_core::duplex::{BoxedSink, BoxedStream, DuplexFrame};
use relay_core::error::DuplexError;

/// Split a live websocket into the sink/stream halves `SafeDuplexChannel`
/// expects. Ping/Pong/Close frames are not forwarded as [`DuplexFrame`]s --
/// axum answers pings itself, and a `Close` simply ends the stream, which is
/// exactly how the duplex channel's receive task detects a clean close.
pub fn split_websocket(socket: WebSocket) -> (BoxedSink, BoxedStream) {
    let (write, read) = socket.split();

    let sink = futures_util::sink::unfold(write, |mut write, frame: DuplexFrame| async move {
        let message = match frame {
            DuplexFrame::Binary(bytes) => Message::Binary(bytes.into()),
            DuplexFrame::Text(text) => Message::Text(text.into()),
        };
        write
            .send(message)
            .await
            .map_err(|err| DuplexError::Write(err.to_string()))?;
        Ok::<_, DuplexError>(write)
    });

    let stream = read.filter_map(|item| async move {
        match item {
            Ok(Message::Binary(bytes)) => Some(Ok(DuplexFrame::Binary(bytes.into()))),
            Ok(Message::Text(text)) => Some(Ok(DuplexFrame::Text(text.to_string()))),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Ok(Message::Close(_)) => None,
            Err(err) => Some(Err(DuplexError::Read(err.to_string()))),
        }
    });

    (Box::pin(sink), Box::pin(stream))
}
