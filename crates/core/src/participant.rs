//! Participant (§4.E): per-subscriber lifecycle, track attachment, and the
//! offer/answer role it plays (answerer on join, offerer once tracks arrive
//! late).

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use relay_protocol::{FramedMessage, SessionDescription};

use crate::datachannel::DataChannelWrapper;
use crate::duplex::SafeDuplexChannel;
use crate::error::HandlerError;
use crate::ice::IceHolder;
use crate::room::Room;
use crate::track::RTP_READ_BUFFER_SIZE;

/// `New → Joined → Negotiating → Active → Terminated`. `Terminated` is a
/// sink: every transition into it is a no-op once already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    New,
    Joined,
    Negotiating,
    Active,
    Terminated,
}

pub struct Participant {
    pub id: Uuid,
    pub name: String,
    room: Weak<Room>,
    pub peer_connection: Arc<RTCPeerConnection>,
    pub duplex: SafeDuplexChannel,
    pub data_channel: Mutex<Option<DataChannelWrapper>>,
    pub ice_holder: IceHolder,
    state: Mutex<ParticipantState>,
}

impl Participant {
    pub fn new(
        name: String,
        room: Weak<Room>,
        peer_connection: Arc<RTCPeerConnection>,
        duplex: SafeDuplexChannel,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name,
            room,
            peer_connection,
            duplex,
            data_channel: Mutex::new(None),
            ice_holder: IceHolder::default(),
            state: Mutex::new(ParticipantState::New),
        })
    }

    pub async fn state(&self) -> ParticipantState {
        *self.state.lock().await
    }

    pub async fn set_state(&self, next: ParticipantState) {
        let mut state = self.state.lock().await;
        if *state != ParticipantState::Terminated {
            *state = next;
        }
    }

    /// Add a forward-track sender and spawn its RTCP drain task. The drain
    /// task exists purely to empty the sender's RTCP queue (back-pressure
    /// relief); it runs until the sender errors, at which point the sender
    /// is considered gone.
    pub async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), HandlerError> {
        let sender = self.peer_connection.add_track(track).await?;
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTP_READ_BUFFER_SIZE];
            loop {
                if sender.read(&mut buf).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Create an offer, set it as the local description, and send it over
    /// the duplex channel. Used once the room's forward-tracks exist,
    /// whether at join time (room already online) or later
    /// (`signalParticipantsWithTracks`).
    pub async fn signal_offer(&self) -> Result<(), HandlerError> {
        self.set_state(ParticipantState::Negotiating).await;
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        self.duplex
            .send(&FramedMessage::Sdp {
                latency_tracker: None,
                sdp: SessionDescription {
                    sdp_type: "offer".to_string(),
                    sdp: offer.sdp,
                },
            })
            .await?;
        Ok(())
    }

    /// Terminate idempotently: mark the state machine terminal and remove
    /// this participant from its room. Safe to call more than once and from
    /// more than one trigger (duplex close, peer-connection failure).
    pub async fn terminate(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if *state == ParticipantState::Terminated {
                return;
            }
            *state = ParticipantState::Terminated;
        }
        debug!(participant = %self.id, "terminating participant");
        if let Some(room) = self.room.upgrade() {
            room.remove_participant_by_id(self.id).await;
        } else {
            warn!(participant = %self.id, "room already gone during participant termination");
        }
    }
}
