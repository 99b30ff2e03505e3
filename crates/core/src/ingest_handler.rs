//! Ingest handler (§4.H): drives the ingest side of signalling and wires the
//! peer-connection callbacks that materialise forward-tracks from received
//! RTP.

use std::sync::Arc;

use tracing::{debug, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_remote::TrackRemote;

use relay_protocol::{AnswerType, FramedMessage, IceCandidate, SessionDescription, decode_message};

use crate::datachannel::DataChannelWrapper;
use crate::duplex::SafeDuplexChannel;
use crate::error::HandlerError;
use crate::facade::WebRtcFacade;
use crate::ice::IceHolder;
use crate::registry::RoomRegistry;
use crate::room::{IngestBinding, Room};
use crate::sdp::strip_sprop_maxcapturerate;

/// Bind `duplex` as the ingest for `room_name`, rejecting it with
/// `answer(in_use)` if the room already has one bound (§9 decision (i): the
/// incumbent ingest is left completely undisturbed).
pub async fn handle_ingest_join(
    registry: &Arc<RoomRegistry>,
    facade: &WebRtcFacade,
    room_name: &str,
    duplex: SafeDuplexChannel,
) -> Result<(), HandlerError> {
    let room = registry.get_or_create_room(room_name).await;

    // No close watcher wired yet -- a candidate pc that loses the bind race
    // below gets closed a few lines down, and that close must not cascade
    // into the incumbent ingest's room (§8 S2, §9 decision (i)).
    let pc = facade.new_peer_connection(|| {}).await?;

    let binding = IngestBinding::new(duplex.clone(), Arc::clone(&pc));
    if room.bind_ingest(binding).await.is_err() {
        warn!(room = %room_name, "rejecting second ingest, room already bound");
        duplex
            .send(&FramedMessage::Answer {
                latency_tracker: None,
                answer_type: AnswerType::InUse,
            })
            .await?;
        let _ = pc.close().await;
        return Ok(());
    }

    let room_for_close = Arc::clone(&room);
    WebRtcFacade::watch_close(&pc, move || {
        let room = Arc::clone(&room_for_close);
        tokio::spawn(async move {
            room.handle_ingest_closed().await;
        });
    });

    install_track_callback(&pc, &room);
    install_data_channel_callback(&pc, &room);
    let ice_holder = Arc::new(IceHolder::default());
    install_ice_candidate_callback(&pc, &duplex);
    install_duplex_callbacks(&duplex, &pc, Arc::clone(&ice_holder));

    duplex
        .on_close({
            let room = Arc::clone(&room);
            let pc = Arc::clone(&pc);
            move || {
                tokio::spawn(async move {
                    if pc.connection_state() != webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState::Connected {
                        room.handle_ingest_closed().await;
                    }
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

    Ok(())
}

/// WHIP compatibility shim (§9): a single HTTP request carrying a plain-text
/// SDP offer, answered once ICE gathering completes. No duplex channel is
/// ever established, so there is no trickle ICE and no later offer can be
/// pushed to this ingest -- it lives and dies with the peer connection.
pub async fn handle_ingest_whip(
    registry: &Arc<RoomRegistry>,
    facade: &WebRtcFacade,
    room_name: &str,
    offer_sdp: String,
) -> Result<String, HandlerError> {
    let room = registry.get_or_create_room(room_name).await;

    // Same ordering as `handle_ingest_join`: no teardown watcher until the
    // bind succeeds, so a losing candidate's own `pc.close()` below can't
    // tear down an incumbent ingest's room.
    let pc = facade.new_peer_connection(|| {}).await?;

    let binding = IngestBinding::new(SafeDuplexChannel::inert(), Arc::clone(&pc));
    if room.bind_ingest(binding).await.is_err() {
        let _ = pc.close().await;
        return Err(crate::error::RoomError::IngestAlreadyBound(room_name.to_string()).into());
    }

    let room_for_close = Arc::clone(&room);
    WebRtcFacade::watch_close(&pc, move || {
        let room = Arc::clone(&room_for_close);
        tokio::spawn(async move {
            room.handle_ingest_closed().await;
        });
    });

    install_track_callback(&pc, &room);
    install_data_channel_callback(&pc, &room);

    let rewritten = strip_sprop_maxcapturerate(&offer_sdp);
    let offer = RTCSessionDescription::offer(rewritten)?;
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

fn install_track_callback(pc: &Arc<RTCPeerConnection>, room: &Arc<Room>) {
    let room = Arc::clone(room);
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let room = Arc::clone(&room);
        Box::pin(async move {
            let kind = track.kind();
            debug!(?kind, "ingest remote track received");
            room.handle_remote_track(track, kind).await;
        })
    }));
}

fn install_data_channel_callback(pc: &Arc<RTCPeerConnection>, room: &Arc<Room>) {
    let room = Arc::clone(room);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let room = Arc::clone(&room);
        Box::pin(async move {
            debug!(label = %dc.label(), "ingest data channel opened");
            let wrapper = DataChannelWrapper::wrap(dc);
            room.set_ingest_data_channel(wrapper).await;
        })
    }));
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
                    warn!(%err, "failed to serialize ingest ice candidate");
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
    ice_holder: Arc<IceHolder>,
) {
    let duplex_clone = duplex.clone();
    let pc_for_ice = Arc::clone(pc);
    let ice_holder_for_ice = Arc::clone(&ice_holder);
    tokio::spawn({
        let duplex = duplex_clone.clone();
        async move {
            duplex
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
                            warn!(%err, "failed to apply ingest ice candidate");
                        }
                    });
                })
                .await;
        }
    });

    let pc_for_sdp = Arc::clone(pc);
    let duplex_for_sdp = duplex_clone.clone();
    let ice_holder_for_sdp = Arc::clone(&ice_holder);
    tokio::spawn({
        let duplex = duplex_clone.clone();
        async move {
            duplex
                .on("sdp", move |raw| {
                    let Ok(msg) = decode_message::<FramedMessage>(raw) else {
                        return;
                    };
                    let FramedMessage::Sdp { sdp, .. } = msg else {
                        return;
                    };
                    let pc = Arc::clone(&pc_for_sdp);
                    let duplex = duplex_for_sdp.clone();
                    let ice_holder = Arc::clone(&ice_holder_for_sdp);
                    tokio::spawn(async move {
                        if let Err(err) = handle_ingest_offer(&pc, &duplex, &ice_holder, sdp).await {
                            warn!(%err, "failed to negotiate ingest offer");
                        }
                    });
                })
                .await;
        }
    });

    let duplex_for_log = duplex_clone.clone();
    tokio::spawn(async move {
        duplex_for_log
            .on("log", |raw| {
                if let Ok(FramedMessage::Log { level, message, .. }) =
                    decode_message::<FramedMessage>(raw)
                {
                    debug!(%level, %message, "ingest log frame");
                }
            })
            .await;
    });

    let duplex_for_metrics = duplex_clone.clone();
    tokio::spawn(async move {
        duplex_for_metrics
            .on("metrics", |raw| {
                if decode_message::<FramedMessage>(raw).is_ok() {
                    debug!("ingest metrics frame received");
                }
            })
            .await;
    });
}

async fn handle_ingest_offer(
    pc: &Arc<RTCPeerConnection>,
    duplex: &SafeDuplexChannel,
    ice_holder: &Arc<IceHolder>,
    sdp: SessionDescription,
) -> Result<(), HandlerError> {
    let rewritten = strip_sprop_maxcapturerate(&sdp.sdp);
    let offer = RTCSessionDescription::offer(rewritten)?;
    pc.set_remote_description(offer).await?;
    ice_holder.flush(pc).await?;

    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer.clone()).await?;

    duplex
        .send(&FramedMessage::Sdp {
            latency_tracker: None,
            sdp: SessionDescription {
                sdp_type: "answer".to_string(),
                sdp: answer.sdp,
            },
        })
        .await?;
    Ok(())
}
