//! The safe duplex channel (§4.B): a write-serialised, typed-dispatch wrapper
//! around any transport that can be split into a binary `Stream`/`Sink` pair.
//! `relay-core` never names a concrete transport — the HTTP boundary crate is
//! responsible for adapting its socket type (an axum `WebSocket`, say) into
//! the [`DuplexFrame`] stream/sink this module consumes.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use relay_protocol::{MessageBase, decode_message, encode_message};

use crate::error::DuplexError;

/// A single inbound or outbound unit on the underlying transport, already
/// stripped of whatever framing (websocket opcode, ping/pong, etc.) the
/// transport itself uses.
#[derive(Debug, Clone)]
pub enum DuplexFrame {
    Binary(Vec<u8>),
    Text(String),
}

pub type BoxedSink = Pin<Box<dyn Sink<DuplexFrame, Error = DuplexError> + Send>>;
pub type BoxedStream = Pin<Box<dyn Stream<Item = Result<DuplexFrame, DuplexError>> + Send>>;

/// A callback registered for one `payload_type` tag. Receives the full raw
/// frame bytes (gzip-JSON), not a pre-decoded message, so a handler can
/// re-decode into whichever concrete type it needs, or forward the bytes on
/// verbatim without ever materialising a Rust struct.
type Callback = Box<dyn Fn(&[u8]) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce() + Send>;

struct Inner {
    sink: Mutex<BoxedSink>,
    callbacks: Mutex<HashMap<String, Callback>>,
    close_handler: Mutex<Option<CloseHandler>>,
}

/// A bound, running duplex channel. Cloning shares the same underlying
/// connection and callback table; the receive task is owned by whichever
/// clone was produced by [`SafeDuplexChannel::spawn`] and outlives all of
/// them until the transport closes.
#[derive(Clone)]
pub struct SafeDuplexChannel {
    inner: Arc<Inner>,
}

impl SafeDuplexChannel {
    /// Take ownership of a transport's sink/stream halves and start its
    /// receive task. `verbose` mirrors the config flag: text frames are only
    /// logged, never dispatched, and only when verbose.
    pub fn spawn(sink: BoxedSink, mut stream: BoxedStream, verbose: bool) -> Self {
        let inner = Arc::new(Inner {
            sink: Mutex::new(sink),
            callbacks: Mutex::new(HashMap::new()),
            close_handler: Mutex::new(None),
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            debug!("duplex receive task started");
            loop {
                match stream.next().await {
                    Some(Ok(DuplexFrame::Binary(data))) => {
                        dispatch(&task_inner, &data).await;
                    }
                    Some(Ok(DuplexFrame::Text(text))) => {
                        if verbose {
                            debug!(%text, "ignoring text frame on duplex channel");
                        }
                    }
                    Some(Err(err)) => {
                        warn!(%err, "duplex read error, terminating receive task");
                        break;
                    }
                    None => {
                        debug!("duplex channel closed cleanly");
                        break;
                    }
                }
            }

            task_inner.callbacks.lock().await.clear();
            if let Some(handler) = task_inner.close_handler.lock().await.take() {
                handler();
            }
            debug!("duplex receive task exited");
        });

        Self { inner }
    }

    /// A duplex channel with no underlying transport: outbound frames are
    /// dropped, and the receive task never sees a frame, an error, or a
    /// close. Used by the WHIP/WHEP compatibility shim (§9), where ingest or
    /// participant setup is a single HTTP request/response with no ongoing
    /// signalling channel to speak of, but the ingest/participant handlers
    /// still expect a `SafeDuplexChannel` to bind into a `Room`.
    pub fn inert() -> Self {
        let sink = futures_util::sink::unfold((), |_, _frame: DuplexFrame| async move {
            Ok::<_, DuplexError>(())
        });
        let stream = futures_util::stream::pending();
        Self::spawn(Box::pin(sink), Box::pin(stream), false)
    }

    /// Register (or replace) the callback for `tag`. Safe to call from any
    /// task at any time, including from inside another callback.
    pub async fn on(&self, tag: &str, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.inner
            .callbacks
            .lock()
            .await
            .insert(tag.to_string(), Box::new(callback));
    }

    pub async fn off(&self, tag: &str) {
        self.inner.callbacks.lock().await.remove(tag);
    }

    /// Install the close handler. Only the most recently installed handler
    /// fires; it fires exactly once, whether the close was clean or abnormal.
    pub async fn on_close(&self, handler: impl FnOnce() + Send + 'static) {
        *self.inner.close_handler.lock().await = Some(Box::new(handler));
    }

    /// Encode and send `msg` as a single binary frame. Serialised against
    /// every other sender on this channel so frames are never interleaved.
    pub async fn send(&self, msg: &impl serde::Serialize) -> Result<(), DuplexError> {
        let bytes = encode_message(msg)?;
        self.send_raw(bytes).await
    }

    /// Send pre-encoded bytes verbatim, e.g. a frame forwarded unmodified
    /// from another channel.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), DuplexError> {
        let mut sink = self.inner.sink.lock().await;
        sink.send(DuplexFrame::Binary(bytes)).await
    }
}

async fn dispatch(inner: &Arc<Inner>, data: &[u8]) {
    match decode_message::<MessageBase>(data) {
        Ok(base) => {
            let callbacks = inner.callbacks.lock().await;
            if let Some(cb) = callbacks.get(&base.payload_type) {
                cb(data);
            }
        }
        Err(err) => {
            debug!(%err, "dropped frame with unreadable base envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use relay_protocol::{AnswerType, FramedMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn mock_sink() -> (BoxedSink, mpsc::UnboundedReceiver<DuplexFrame>) {
        let (tx, rx) = mpsc::unbounded_channel::<DuplexFrame>();
        let sink = futures_util::sink::unfold(tx, |tx, frame: DuplexFrame| async move {
            tx.send(frame).map_err(|_| DuplexError::Closed)?;
            Ok::<_, DuplexError>(tx)
        });
        (Box::pin(sink), rx)
    }

    fn mock_stream_from(
        frames: Vec<Result<DuplexFrame, DuplexError>>,
    ) -> BoxedStream {
        Box::pin(stream::iter(frames))
    }

    #[tokio::test]
    async fn dispatches_known_tag_to_registered_callback() {
        let msg = FramedMessage::Answer {
            latency_tracker: None,
            answer_type: AnswerType::Ok,
        };
        let bytes = relay_protocol::encode_message(&msg).unwrap();
        let (sink, _rx) = mock_sink();
        let stream = mock_stream_from(vec![Ok(DuplexFrame::Binary(bytes))]);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        let channel = SafeDuplexChannel::spawn(sink, stream, false);
        channel
            .on("answer", move |_raw| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_tag_is_silently_dropped() {
        let msg = FramedMessage::Log {
            latency_tracker: None,
            level: "info".into(),
            message: "hi".into(),
            time: "2024-01-01T00:00:00Z".into(),
        };
        let bytes = relay_protocol::encode_message(&msg).unwrap();
        let (sink, _rx) = mock_sink();
        let stream = mock_stream_from(vec![Ok(DuplexFrame::Binary(bytes))]);

        let channel = SafeDuplexChannel::spawn(sink, stream, false);
        // no callback registered for "log" -- must not panic, must not hang.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(channel);
    }

    #[tokio::test]
    async fn malformed_frame_does_not_terminate_channel() {
        let good = FramedMessage::Answer {
            latency_tracker: None,
            answer_type: AnswerType::Ok,
        };
        let good_bytes = relay_protocol::encode_message(&good).unwrap();
        let (sink, _rx) = mock_sink();
        let stream = mock_stream_from(vec![
            Ok(DuplexFrame::Binary(b"not gzip".to_vec())),
            Ok(DuplexFrame::Binary(good_bytes)),
        ]);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        let channel = SafeDuplexChannel::spawn(sink, stream, false);
        channel
            .on("answer", move |_raw| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_handler_fires_once_on_stream_end() {
        let (sink, _rx) = mock_sink();
        let stream = mock_stream_from(vec![]);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let channel = SafeDuplexChannel::spawn(sink, stream, false);
        channel
            .on_close(move || {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inert_channel_never_closes_and_swallows_sends() {
        let channel = SafeDuplexChannel::inert();
        let msg = FramedMessage::Answer {
            latency_tracker: None,
            answer_type: AnswerType::Ok,
        };
        channel.send(&msg).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        channel.on_close(move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callbacks_cleared_after_close_so_late_registration_is_inert() {
        let (sink, _rx) = mock_sink();
        let stream = mock_stream_from(vec![]);
        let channel = SafeDuplexChannel::spawn(sink, stream, false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        channel
            .on("answer", move |_raw| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(channel.inner.callbacks.lock().await.is_empty());
        let _ = seen;
    }

    #[tokio::test]
    async fn send_encodes_and_forwards_single_frame() {
        let (sink, mut rx) = mock_sink();
        let stream = mock_stream_from(vec![]);
        let channel = SafeDuplexChannel::spawn(sink, stream, false);

        let msg = FramedMessage::Answer {
            latency_tracker: None,
            answer_type: AnswerType::Ok,
        };
        channel.send(&msg).await.unwrap();

        let frame = rx.recv().await.unwrap();
        match frame {
            DuplexFrame::Binary(bytes) => {
                let decoded: FramedMessage = relay_protocol::decode_message(&bytes).unwrap();
                assert!(matches!(
                    decoded,
                    FramedMessage::Answer {
                        answer_type: AnswerType::Ok,
                        ..
                    }
                ));
            }
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
}
