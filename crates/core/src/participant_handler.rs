//! Participant handler (§4.I): drives the participant side of signalling and
//! the input-plane plumbing from participant to ingest.

use std::sync::Arc;

use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;

use relay_protocol::{AnswerType, FramedMessage, IceCandidate, SessionDescription, decode_message};

use crate::datachannel::{DataChannelWrapper, unreliable_data_channel_init};
use crate::duplex::SafeDuplexChannel;
use crate::error::HandlerError;
use crate::facade::WebRtcFacade;
use crate::ice::IceHolder;
use crate::participant::Participant;
use crate::registry::RoomRegistry;

const INPUT_DATA_CHANNEL_LABEL: &str = "data";

/// Join a new participant onto `room_name`. Always answered `ok`; if the
/// room is already online, both forward-tracks are attached immediately and
/// an offer is sent right away (§4.I step 6).
pub async fn handle_participant_join(
    registry: &Arc<RoomRegistry>,
    facade: &WebRtcFacade,
    room_name: &str,
    name: String,
    duplex: SafeDuplexChannel,
) -> Result<(), HandlerError> {
    let room = registry.get_or_create_room(room_name).await;

    let room_for_close = Arc::clone(&room);
    // Filled in once the participant exists; the peer connection must exist
    // before the participant struct, but the close callback needs the
    // participant's id to remove it, so route through a once-cell-like
    // shared slot instead of restructuring construction order.
    let participant_id_slot: Arc<tokio::sync::Mutex<Option<uuid::Uuid>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    let id_slot_for_close = Arc::clone(&participant_id_slot);

    let pc = facade
        .new_peer_connection(move || {
            let room = Arc::clone(&room_for_close);
            let id_slot = Arc::clone(&id_slot_for_close);
            tokio::spawn(async move {
                if let Some(id) = *id_slot.lock().await {
                    room.remove_participant_by_id(id).await;
                }
            });
        })
        .await?;

    let data_channel = pc
        .create_data_channel(INPUT_DATA_CHANNEL_LABEL, Some(unreliable_data_channel_init()))
        .await?;
    let input_channel = DataChannelWrapper::wrap(data_channel);
    install_input_forwarding(&input_channel, &room);

    install_ice_candidate_callback(&pc, &duplex);

    let participant = Participant::new(name, Arc::downgrade(&room), Arc::clone(&pc), duplex.clone());
    *participant_id_slot.lock().await = Some(participant.id);
    room.add_participant(Arc::clone(&participant)).await;

    let ice_holder = Arc::new(IceHolder::default());
    install_duplex_callbacks(&duplex, &pc, Arc::clone(&participant), ice_holder);

    duplex
        .on_close({
            let participant = Arc::clone(&participant);
            move || {
                tokio::spawn(async move {
                    participant.terminate().await;
                });
            }
        })
        .await;

    duplex
        .send(&FramedMessage::Answer {
            latency_tracker: None,
            answer_type: AnswerType::Ok,
        })
        .await?;

    if let Some((audio, video)) = room.current_forward_tracks().await {
        let audio_track: Arc<dyn TrackLocal + Send + Sync> = audio;
        let video_track: Arc<dyn TrackLocal + Send + Sync> = video;
        participant.add_track(audio_track).await?;
        participant.add_track(video_track).await?;
        participant.signal_offer().await?;
    } else {
        // Room has no forward-tracks yet (§4.E, §8 S1): tell the participant
        // it joined a still-offline room. It stays connected and receives a
        // relay-originated offer once `signalParticipantsWithTracks` runs.
        duplex
            .send(&FramedMessage::Answer {
                latency_tracker: None,
                answer_type: AnswerType::Offline,
            })
            .await?;
    }

    Ok(())
}

/// WHEP compatibility shim (§9): the client sends a recvonly SDP offer over
/// plain HTTP; the relay attaches the room's forward-tracks (if any already
/// exist) and answers once ICE gathering completes. Unlike the websocket
/// path the relay is the *answerer* here, matching the WHEP protocol's roles.
/// A participant that joins before the room goes online gets a track-less
/// answer and never hears about the room coming online afterwards -- there is
/// no duplex channel to push a renegotiated offer over.
pub async fn handle_participant_whep(
    registry: &Arc<RoomRegistry>,
    facade: &WebRtcFacade,
    room_name: &str,
    offer_sdp: String,
) -> Result<String, HandlerError> {
    let room = registry.get_or_create_room(room_name).await;

    let room_for_close = Arc::clone(&room);
    let participant_id_slot: Arc<tokio::sync::Mutex<Option<uuid::Uuid>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    let id_slot_for_close = Arc::clone(&participant_id_slot);
    let pc = facade
        .new_peer_connection(move || {
            let room = Arc::clone(&room_for_close);
            let id_slot = Arc::clone(&id_slot_for_close);
            tokio::spawn(async move {
                if let Some(id) = *id_slot.lock().await {
                    room.remove_participant_by_id(id).await;
                }
            });
        })
        .await?;

    let participant = Participant::new(
        format!("whep-{}", uuid::Uuid::new_v4()),
        Arc::downgrade(&room),
        Arc::clone(&pc),
        SafeDuplexChannel::inert(),
    );
    *participant_id_slot.lock().await = Some(participant.id);
    room.add_participant(Arc::clone(&participant)).await;

    if let Some((audio, video)) = room.current_forward_tracks().await {
        let audio_track: Arc<dyn TrackLocal + Send + Sync> = audio;
        let video_track: Arc<dyn TrackLocal + Send + Sync> = video;
        participant.add_track(audio_track).await?;
        participant.add_track(video_track).await?;
    }

    let offer = RTCSessionDescription::offer(offer_sdp)?;
    pc.set_remote_description(offer).await?;

    let answer = pc.create_answer(None).await?;
    let mut gathering_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gathering_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or(crate::error::RoomError::NoLocalDescription)?;
    Ok(local.sdp)
}

/// Binary frames on the participant's input data channel tagged `input` are
/// forwarded verbatim to the room's ingest data channel, if one is open.
/// Any other tag is dropped (§9 decision (ii)).
fn install_input_forwarding(input_channel: &DataChannelWrapper, room: &Arc<crate::room::Room>) {
    let room = Arc::clone(room);
    let input_channel = input_channel.clone();
    tokio::spawn(async move {
        input_channel
            .on("input", move |raw| {
                let room = Arc::clone(&room);
                let bytes = raw.to_vec();
                tokio::spawn(async move {
                    if let Some(ingest_dc) = room.ingest_data_channel().await {
                        if let Err(err) = ingest_dc.send_raw(bytes).await {
                            warn!(%err, "failed to forward input frame to ingest");
                        }
                    }
                });
            })
            .await;
    });
}

fn install_ice_candidate_callback(pc: &Arc<RTCPeerConnection>, duplex: &SafeDuplexChannel) {
    let duplex = duplex.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let duplex = duplex.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(err) => {
                    warn!(%err, "failed to serialize participant ice candidate");
                    return;
                }
            };
            let msg = FramedMessage::Ice {
                latency_tracker: None,
                candidate: IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                },
            };
            let _ = duplex.send(&msg).await;
        })
    }));
}

fn install_duplex_callbacks(
    duplex: &SafeDuplexChannel,
    pc: &Arc<RTCPeerConnection>,
    participant: Arc<Participant>,
    ice_holder: Arc<IceHolder>,
) {
    let pc_for_ice = Arc::clone(pc);
    let ice_holder_for_ice = Arc::clone(&ice_holder);
    let duplex_for_ice = duplex.clone();
    tokio::spawn(async move {
        duplex_for_ice
            .on("ice", move |raw| {
                let Ok(msg) = decode_message::<FramedMessage>(raw) else {
                    return;
                };
                let FramedMessage::Ice { candidate, .. } = msg else {
                    return;
                };
                let pc = Arc::clone(&pc_for_ice);
                let holder = Arc::clone(&ice_holder_for_ice);
                tokio::spawn(async move {
                    let init = RTCIceCandidateInit {
                        candidate: candidate.candidate,
                        sdp_mid: candidate.sdp_mid,
                        sdp_mline_index: candidate.sdp_mline_index,
                        ..Default::default()
                    };
                    if let Err(err) = holder.add_or_buffer(&pc, init).await {
                        warn!(%err, "failed to apply participant ice candidate");
                    }
                });
            })
            .await;
    });

    let pc_for_sdp = Arc::clone(pc);
    let duplex_for_sdp = duplex.clone();
    let participant_for_sdp = Arc::clone(&participant);
    let ice_holder_for_sdp = Arc::clone(&ice_holder);
    tokio::spawn(async move {
        duplex_for_sdp
            .on("sdp", move |raw| {
                let Ok(msg) = decode_message::<FramedMessage>(raw) else {
                    return;
                };
                let FramedMessage::Sdp { sdp, .. } = msg else {
                    return;
                };
                let pc = Arc::clone(&pc_for_sdp);
                let participant = Arc::clone(&participant_for_sdp);
                let ice_holder = Arc::clone(&ice_holder_for_sdp);
                tokio::spawn(async move {
                    if let Err(err) = handle_participant_answer(&pc, &ice_holder, sdp).await {
                        warn!(participant = %participant.id, %err, "failed to apply participant sdp answer");
                    } else {
                        participant
                            .set_state(crate::participant::ParticipantState::Active)
                            .await;
                    }
                });
            })
            .await;
    });

    let duplex_for_log = duplex.clone();
    tokio::spawn(async move {
        duplex_for_log
            .on("log", |raw| {
                if let Ok(FramedMessage::Log { level, message, .. }) =
                    decode_message::<FramedMessage>(raw)
                {
                    debug!(%level, %message, "participant log frame");
                }
            })
            .await;
    });

    let duplex_for_metrics = duplex.clone();
    tokio::spawn(async move {
        duplex_for_metrics
            .on("metrics", |raw| {
                if decode_message::<FramedMessage>(raw).is_ok() {
                    debug!("participant metrics frame received");
                }
            })
            .await;
    });
}

/// Inbound `sdp` on the participant channel is the answer to our
/// relay-originated offer (unlike the ingest, where it is an offer). No
/// error surfaces back to the peer on decode failure; the connection simply
/// remains pending (§4.E).
async fn handle_participant_answer(
    pc: &Arc<RTCPeerConnection>,
    ice_holder: &Arc<IceHolder>,
    sdp: SessionDescription,
) -> Result<(), HandlerError> {
    let answer = RTCSessionDescription::answer(sdp.sdp)?;
    pc.set_remote_description(answer).await?;
    ice_holder.flush(pc).await?;
    Ok(())
}
