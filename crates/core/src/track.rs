//! Forward tracks (§3, §4.F): the relay-owned local tracks that copy a
//! remote ingest track's RTP packets out to every attached participant
//! sender.

use std::sync::Arc;

use tracing::{debug, warn};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

/// Bytes read per RTP packet off the remote track. Named explicitly because
/// §8 calls out exactly-1400-byte payloads as a boundary case.
pub const RTP_READ_BUFFER_SIZE: usize = 1400;

/// Materialise a local forward-track carrying `remote`'s codec capability.
/// Stream id is `"<room>-<kind>"` (§3's ordering; see DESIGN.md for the
/// resolution of the discrepancy with §4.F's prose).
pub fn materialize_forward_track(
    remote: &TrackRemote,
    room_name: &str,
    kind: RTPCodecType,
) -> Arc<TrackLocalStaticRTP> {
    let stream_id = format!("{room_name}-{kind}");
    Arc::new(TrackLocalStaticRTP::new(
        remote.codec().capability,
        kind.to_string(),
        stream_id,
    ))
}

/// Spawn the per-remote-track forwarding task: read RTP off `remote`, write
/// each packet to `local`. `io::EOF`-equivalent stream end terminates
/// cleanly; closed-pipe write errors (sender gone) are tolerated and simply
/// stop this task, since the sender side is responsible for its own
/// lifecycle; any other error also stops the task. `on_ended` runs exactly
/// once, after the loop exits, regardless of which branch exited it.
pub fn spawn_forward_task(
    remote: Arc<TrackRemote>,
    local: Arc<TrackLocalStaticRTP>,
    on_ended: impl FnOnce() + Send + 'static,
) {
    tokio::spawn(async move {
        debug!(track_id = %remote.id(), "rtp forward task started");
        let mut buf = vec![0u8; RTP_READ_BUFFER_SIZE];
        loop {
            match remote.read(&mut buf).await {
                Ok((packet, _attrs)) => {
                    if let Err(err) = local.write_rtp(&packet).await {
                        if is_closed_pipe(&err) {
                            debug!("forward track write hit a closed sender, stopping");
                        } else {
                            warn!(%err, "forward track write failed, stopping");
                        }
                        break;
                    }
                }
                Err(err) if is_track_ended(&err) => {
                    debug!("remote track ended");
                    break;
                }
                Err(err) => {
                    warn!(%err, "remote track read failed, stopping");
                    break;
                }
            }
        }
        on_ended();
        debug!("rtp forward task exited");
    });
}

fn is_track_ended(err: &webrtc::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("eof") || msg.contains("track closed") || msg.contains("track remote closed")
}

fn is_closed_pipe(err: &webrtc::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("closed pipe") || msg.contains("broken pipe")
}
