//! WebRTC facade (§4.C): a media/interceptor/setting engine configured once
//! at process start, exposing a peer-connection factory with idempotent
//! close semantics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::sdp_semantics::RTCSdpSemantics;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};

use relay_protocol::RelayConfig;

use crate::error::FacadeError;

const H265_PAYLOAD_TYPE: u8 = 48;
const H265_RTX_PAYLOAD_TYPE: u8 = 49;

/// Process-wide, built-once WebRTC stack. Encapsulated here rather than
/// behind module-level statics per §9's guidance; the server binary owns the
/// single instance and hands it to the ingest/participant handlers.
pub struct WebRtcFacade {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcFacade {
    /// Build the facade once from `config`. Registers the default codec set
    /// (per §4.C, not a hand-picked table), optionally augmented with H.265,
    /// the default interceptor set, and a setting engine constrained to the
    /// configured ephemeral UDP range.
    pub fn new(config: &RelayConfig) -> Result<Self, FacadeError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| FacadeError::MediaEngine(err.to_string()))?;

        if config.enable_h265 {
            register_h265(&mut media_engine)?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|err| FacadeError::Interceptors(err.to_string()))?;

        let mut setting_engine = SettingEngine::default();
        let ephemeral = EphemeralUDP::new(config.webrtc_udp_start, config.webrtc_udp_end)
            .map_err(|err| FacadeError::UdpRange(err.to_string()))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self {
            api,
            ice_servers: vec![RTCIceServer {
                urls: vec![format!("stun:{}", config.stun_server)],
                ..Default::default()
            }],
        })
    }

    /// Create a new peer connection with the facade's ICE servers, bundle
    /// policy, and unified-plan semantics. `on_close` fires exactly once,
    /// when the connection transitions into any terminal state.
    pub async fn new_peer_connection(
        &self,
        on_close: impl Fn() + Send + Sync + 'static,
    ) -> Result<Arc<RTCPeerConnection>, FacadeError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ice_transport_policy: RTCIceTransportPolicy::All,
            bundle_policy: RTCBundlePolicy::Balanced,
            sdp_semantics: RTCSdpSemantics::UnifiedPlan,
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        Self::watch_close(&pc, on_close);
        Ok(pc)
    }

    /// Install (or replace) the connection-state watcher that calls
    /// `on_close` exactly once when `pc` transitions into any terminal
    /// state. Split out of [`Self::new_peer_connection`] so a caller that
    /// must decide whether to keep a freshly created peer connection (e.g.
    /// the ingest join path, which may reject a second ingest) can start it
    /// with a no-op watcher and only wire the real teardown callback once
    /// that decision lands -- wiring it any earlier would let closing a
    /// rejected candidate's own peer connection trigger teardown of
    /// whatever state `on_close` closes over.
    pub fn watch_close(pc: &Arc<RTCPeerConnection>, on_close: impl Fn() + Send + Sync + 'static) {
        let closing = Arc::new(Mutex::new(false));
        let pc_for_watcher = Arc::clone(pc);
        let on_close = Arc::new(on_close);

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let closing = Arc::clone(&closing);
            let pc = Arc::clone(&pc_for_watcher);
            let on_close = Arc::clone(&on_close);
            Box::pin(async move {
                debug!(?state, "peer connection state changed");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed
                ) {
                    let mut already_closing = closing.lock().await;
                    if *already_closing {
                        return;
                    }
                    *already_closing = true;
                    drop(already_closing);
                    if let Err(err) = pc.close().await {
                        warn!(%err, "error closing peer connection");
                    }
                    on_close();
                }
            })
        }));
    }
}

/// Add the H.265 payload-type pair the donor's hand-picked codec table
/// carries as an extra option, matching §4.C's augmentation wording.
fn register_h265(media_engine: &mut MediaEngine) -> Result<(), FacadeError> {
    let feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/H265".to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                    rtcp_feedback: feedback.clone(),
                },
                payload_type: H265_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|err| FacadeError::MediaEngine(err.to_string()))?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/rtx".to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: format!("apt={H265_PAYLOAD_TYPE}"),
                    rtcp_feedback: vec![],
                },
                payload_type: H265_RTX_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|err| FacadeError::MediaEngine(err.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn facade_builds_with_default_config() {
        let config = RelayConfig::default();
        let facade = WebRtcFacade::new(&config);
        assert!(facade.is_ok());
    }

    #[tokio::test]
    async fn facade_rejects_inverted_udp_range() {
        let mut config = RelayConfig::default();
        config.webrtc_udp_start = 20000;
        config.webrtc_udp_end = 10000;
        let facade = WebRtcFacade::new(&config);
        assert!(matches!(facade, Err(FacadeError::UdpRange(_))));
    }

    #[tokio::test]
    async fn facade_with_h265_enabled_still_builds() {
        let mut config = RelayConfig::default();
        config.enable_h265 = true;
        let facade = WebRtcFacade::new(&config);
        assert!(facade.is_ok());
    }

    #[tokio::test]
    async fn new_peer_connection_invokes_on_close_once_on_failure() {
        use std::sync::atomic::AtomicUsize;
        use std::time::Duration;

        let config = RelayConfig::default();
        let facade = WebRtcFacade::new(&config).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let pc = facade
            .new_peer_connection(move || {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        pc.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
