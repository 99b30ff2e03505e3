//! Data-channel wrapper (§4.D): the same two-phase gzip-JSON dispatch as the
//! duplex channel, but over an unreliable/unordered `RTCDataChannel` and its
//! callback-based (not stream-based) receive API.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;

use relay_protocol::{MessageBase, decode_message};

/// Configuration for the relay's one data-channel shape: strictly unreliable,
/// unordered, used for both the ingest control plane and the participant
/// input plane.
pub fn unreliable_data_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(false),
        max_retransmits: Some(0),
        ..Default::default()
    }
}

type Callback = Box<dyn Fn(&[u8]) + Send + Sync>;

struct Inner {
    channel: Arc<RTCDataChannel>,
    callbacks: Mutex<HashMap<String, Callback>>,
}

/// A bound data channel with per-tag dispatch. Unlike [`crate::duplex::SafeDuplexChannel`]
/// this wraps an already-open (or about-to-open) `RTCDataChannel` rather than
/// owning a receive task of its own -- `webrtc-rs` drives `on_message` from
/// its own executor.
#[derive(Clone)]
pub struct DataChannelWrapper {
    inner: Arc<Inner>,
}

impl DataChannelWrapper {
    /// Wrap `channel`, registering the `on_message` handler that performs
    /// dispatch. String frames are dropped per §4.D; binary frames are
    /// base-decoded for their tag and handed to the matching callback as raw
    /// bytes, same contract as the duplex channel.
    pub fn wrap(channel: Arc<RTCDataChannel>) -> Self {
        let inner = Arc::new(Inner {
            channel,
            callbacks: Mutex::new(HashMap::new()),
        });

        let dispatch_inner = Arc::clone(&inner);
        inner.channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let dispatch_inner = Arc::clone(&dispatch_inner);
            Box::pin(async move {
                if msg.is_string {
                    debug!("dropping text frame on data channel");
                    return;
                }
                match decode_message::<MessageBase>(&msg.data) {
                    Ok(base) => {
                        let callbacks = dispatch_inner.callbacks.lock().await;
                        if let Some(cb) = callbacks.get(&base.payload_type) {
                            cb(&msg.data);
                        }
                    }
                    Err(err) => {
                        debug!(%err, "dropped malformed data-channel frame");
                    }
                }
            })
        }));

        Self { inner }
    }

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

    pub async fn on_open(&self, handler: impl FnOnce() + Send + 'static) {
        self.inner
            .channel
            .on_open(Box::new(move || {
                handler();
                Box::pin(async {})
            }));
    }

    pub async fn on_close(&self, handler: impl FnOnce() + Send + 'static) {
        self.inner
            .channel
            .on_close(Box::new(move || {
                handler();
                Box::pin(async {})
            }));
    }

    /// Forward `bytes` unmodified. Used for the participant-input -> ingest
    /// fan-in path (§8 S6), which must never re-encode the frame.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<usize, webrtc::Error> {
        self.inner.channel.send(&Bytes::from(bytes)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreliable_init_matches_room_data_channel_contract() {
        let init = unreliable_data_channel_init();
        assert_eq!(init.ordered, Some(false));
        assert_eq!(init.max_retransmits, Some(0));
    }
}
