//! Room (§4.F): holds the ingest binding, the two local forward-tracks, the
//! participant map, and the online/offline signalling that ties them
//! together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use relay_protocol::{AnswerType, FramedMessage};

use crate::datachannel::DataChannelWrapper;
use crate::duplex::SafeDuplexChannel;
use crate::error::RoomError;
use crate::participant::Participant;
use crate::registry::RoomRegistry;
use crate::track::{materialize_forward_track, spawn_forward_task};

/// The ingest side's bound resources: its duplex channel, peer connection,
/// ICE holder, and (once opened) its data channel. At most one of these is
/// ever live per room (§3's "at most one ingest duplex channel" invariant).
pub struct IngestBinding {
    pub duplex: SafeDuplexChannel,
    pub peer_connection: Arc<RTCPeerConnection>,
    pub data_channel: Mutex<Option<DataChannelWrapper>>,
}

impl IngestBinding {
    pub fn new(duplex: SafeDuplexChannel, peer_connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            duplex,
            peer_connection,
            data_channel: Mutex::new(None),
        }
    }
}

pub struct Room {
    pub id: Uuid,
    pub name: String,
    online: AtomicBool,
    ingest: RwLock<Option<IngestBinding>>,
    audio_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    video_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    participants: RwLock<HashMap<Uuid, Arc<Participant>>>,
    registry: Weak<RoomRegistry>,
}

impl Room {
    pub(crate) fn new(name: String, registry: Weak<RoomRegistry>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name,
            online: AtomicBool::new(false),
            ingest: RwLock::new(None),
            audio_track: RwLock::new(None),
            video_track: RwLock::new(None),
            participants: RwLock::new(HashMap::new()),
            registry,
        })
    }

    pub fn online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub async fn has_ingest(&self) -> bool {
        self.ingest.read().await.is_some()
    }

    /// Bind `binding` as this room's ingest, unless one is already bound
    /// (§4.F: rejected with a soft warning, left to the caller to reply
    /// `answer(in_use)` and close its own side).
    pub async fn bind_ingest(&self, binding: IngestBinding) -> Result<(), RoomError> {
        let mut guard = self.ingest.write().await;
        if guard.is_some() {
            return Err(RoomError::IngestAlreadyBound(self.name.clone()));
        }
        *guard = Some(binding);
        Ok(())
    }

    pub async fn unbind_ingest(&self) {
        *self.ingest.write().await = None;
    }

    /// Ingest peer-connection went terminal (§4.H): unbind it, clear both
    /// forward-track slots, flip offline, notify participants, and let the
    /// registry reap the room if it is now empty too.
    pub async fn handle_ingest_closed(self: &Arc<Self>) {
        *self.audio_track.write().await = None;
        *self.video_track.write().await = None;
        self.unbind_ingest().await;
        if self.online.swap(false, Ordering::SeqCst) {
            self.notify_participants_offline().await;
        }
        self.delete_if_empty().await;
    }

    pub async fn ingest_peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.ingest
            .read()
            .await
            .as_ref()
            .map(|binding| Arc::clone(&binding.peer_connection))
    }

    pub async fn set_ingest_data_channel(&self, data_channel: DataChannelWrapper) {
        if let Some(binding) = self.ingest.read().await.as_ref() {
            *binding.data_channel.lock().await = Some(data_channel);
        }
    }

    /// The ingest's data channel, if the ingest is bound and has opened one.
    /// Used by participants to forward `input` frames verbatim (§8 S6).
    pub async fn ingest_data_channel(&self) -> Option<DataChannelWrapper> {
        match self.ingest.read().await.as_ref() {
            Some(binding) => binding.data_channel.lock().await.clone(),
            None => None,
        }
    }

    pub async fn add_participant(&self, participant: Arc<Participant>) {
        self.participants
            .write()
            .await
            .insert(participant.id, participant);
    }

    pub async fn remove_participant_by_id(self: &Arc<Self>, id: Uuid) {
        self.participants.write().await.remove(&id);
        self.delete_if_empty().await;
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn is_empty_and_offline(&self) -> bool {
        !self.online() && self.participants.read().await.is_empty()
    }

    async fn delete_if_empty(self: &Arc<Self>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.delete_room_if_empty(self).await;
        }
    }

    /// Materialise a forward-track for `remote` and spawn its RTP forward
    /// task. Once both audio and video slots are filled, flips the room
    /// online and signals every attached participant.
    pub async fn handle_remote_track(self: &Arc<Self>, remote: Arc<TrackRemote>, kind: RTPCodecType) {
        let local = materialize_forward_track(&remote, &self.name, kind);
        match kind {
            RTPCodecType::Audio => *self.audio_track.write().await = Some(Arc::clone(&local)),
            RTPCodecType::Video => *self.video_track.write().await = Some(Arc::clone(&local)),
            other => {
                warn!(?other, "ignoring remote track of unexpected kind");
                return;
            }
        }

        let room = Arc::clone(self);
        tokio::spawn({
            let local = Arc::clone(&local);
            let remote = Arc::clone(&remote);
            async move {
                spawn_forward_task(remote, local, move || {
                    tokio::spawn(async move {
                        room.clear_track_and_maybe_offline(kind).await;
                    });
                });
            }
        });

        self.maybe_go_online_and_signal().await;
    }

    async fn clear_track_and_maybe_offline(self: &Arc<Self>, kind: RTPCodecType) {
        match kind {
            RTPCodecType::Audio => *self.audio_track.write().await = None,
            RTPCodecType::Video => *self.video_track.write().await = None,
            _ => {}
        }
        let both_cleared =
            self.audio_track.read().await.is_none() && self.video_track.read().await.is_none();
        if both_cleared && self.online.swap(false, Ordering::SeqCst) {
            self.notify_participants_offline().await;
            self.delete_if_empty().await;
        }
    }

    async fn maybe_go_online_and_signal(self: &Arc<Self>) {
        let audio = self.audio_track.read().await.clone();
        let video = self.video_track.read().await.clone();
        if let (Some(audio), Some(video)) = (audio, video) {
            if !self.online.swap(true, Ordering::SeqCst) {
                self.signal_participants_with_tracks(audio, video).await;
            }
        }
    }

    async fn signal_participants_with_tracks(
        &self,
        audio: Arc<TrackLocalStaticRTP>,
        video: Arc<TrackLocalStaticRTP>,
    ) {
        let participants: Vec<_> = self.participants.read().await.values().cloned().collect();
        for participant in participants {
            let audio_track: Arc<dyn TrackLocal + Send + Sync> = audio.clone();
            let video_track: Arc<dyn TrackLocal + Send + Sync> = video.clone();
            if let Err(err) = participant.add_track(audio_track).await {
                warn!(participant = %participant.id, %err, "failed to add audio forward track");
                continue;
            }
            if let Err(err) = participant.add_track(video_track).await {
                warn!(participant = %participant.id, %err, "failed to add video forward track");
                continue;
            }
            if let Err(err) = participant.signal_offer().await {
                warn!(participant = %participant.id, %err, "failed to signal offer");
            }
        }
    }

    /// Forward-tracks to hand a newly-joined participant when the room is
    /// already online (§4.I step 6).
    pub async fn current_forward_tracks(
        &self,
    ) -> Option<(Arc<TrackLocalStaticRTP>, Arc<TrackLocalStaticRTP>)> {
        let audio = self.audio_track.read().await.clone()?;
        let video = self.video_track.read().await.clone()?;
        Some((audio, video))
    }

    async fn notify_participants_offline(&self) {
        debug!(room = %self.name, "room going offline, notifying participants");
        let participants: Vec<_> = self.participants.read().await.values().cloned().collect();
        for participant in participants {
            let _ = participant
                .duplex
                .send(&FramedMessage::Answer {
                    latency_tracker: None,
                    answer_type: AnswerType::Offline,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_room(name: &str) -> Arc<Room> {
        Room::new(name.to_string(), Weak::new())
    }

    #[tokio::test]
    async fn new_room_is_offline_and_empty() {
        let room = bare_room("alpha");
        assert!(!room.online());
        assert!(room.is_empty_and_offline().await);
    }

    #[tokio::test]
    async fn ingest_already_bound_is_rejected() {
        use crate::facade::WebRtcFacade;
        let config = relay_protocol::RelayConfig::default();
        let facade = WebRtcFacade::new(&config).unwrap();
        let pc1 = facade.new_peer_connection(|| {}).await.unwrap();
        let pc2 = facade.new_peer_connection(|| {}).await.unwrap();

        let room = bare_room("alpha");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = futures_util::sink::unfold(tx, |tx, frame: crate::duplex::DuplexFrame| async move {
            tx.send(frame).map_err(|_| crate::error::DuplexError::Closed)?;
            Ok::<_, crate::error::DuplexError>(tx)
        });
        let stream = Box::pin(futures_util::stream::empty());
        let duplex1 = SafeDuplexChannel::spawn(Box::pin(sink), stream, false);

        let binding1 = IngestBinding::new(duplex1.clone(), pc1);
        assert!(room.bind_ingest(binding1).await.is_ok());

        let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
        let sink2 = futures_util::sink::unfold(tx2, |tx, frame: crate::duplex::DuplexFrame| async move {
            tx.send(frame).map_err(|_| crate::error::DuplexError::Closed)?;
            Ok::<_, crate::error::DuplexError>(tx)
        });
        let stream2 = Box::pin(futures_util::stream::empty());
        let duplex2 = SafeDuplexChannel::spawn(Box::pin(sink2), stream2, false);
        let binding2 = IngestBinding::new(duplex2, pc2);
        assert!(matches!(
            room.bind_ingest(binding2).await,
            Err(RoomError::IngestAlreadyBound(_))
        ));
    }

    #[tokio::test]
    async fn removing_last_participant_leaves_room_empty() {
        let room = bare_room("alpha");
        assert!(room.is_empty_and_offline().await);
        assert_eq!(room.participant_count().await, 0);
    }
}
