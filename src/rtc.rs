//! WebRTC-backed negotiator and a synthetic local media source.
//!
//! Signal payloads use the JSON shapes browser peers exchange:
//! `{"type":"offer"|"answer","sdp":..}` and
//! `{"type":"candidate","candidate":{"candidate":..,"sdpMLineIndex":..,"sdpMid":..}}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServer;
use crate::error::{MediaError, NegotiationError};
use crate::media::{LocalStream, MediaSource, MediaTrack, RemoteStream, TrackKind};
use crate::peer::{NegotiationEvent, NegotiationEvents, Negotiator, NegotiatorFactory};
use crate::session::Role;

const RTCP_BUFFER_LEN: usize = 1500;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: CandidatePayload,
    },
    /// Renegotiation hints and anything else we do not act on
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize, Deserialize)]
struct CandidatePayload {
    candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default)]
    sdp_mid: Option<String>,
}

impl From<RTCIceCandidateInit> for CandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mline_index: init.sdp_mline_index,
            sdp_mid: init.sdp_mid,
        }
    }
}

impl From<CandidatePayload> for RTCIceCandidateInit {
    fn from(payload: CandidatePayload) -> Self {
        RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: None,
        }
    }
}

fn description_signal(kind: &str, sdp: String) -> Value {
    json!({ "type": kind, "sdp": sdp })
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates one `RTCPeerConnection` per controller
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcNegotiatorFactory;

#[async_trait]
impl NegotiatorFactory for RtcNegotiatorFactory {
    async fn create(
        &self,
        role: Role,
        stream: LocalStream,
        ice_servers: &[IceServer],
        events: NegotiationEvents,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let negotiator = Arc::new(RtcNegotiator {
            pc,
            events,
            pending_candidates: Mutex::new(Vec::new()),
            destroyed: Arc::new(AtomicBool::new(false)),
        });
        negotiator.attach_handlers();

        if let Err(e) = negotiator.prepare(role, &stream).await {
            negotiator.destroy().await;
            return Err(e);
        }

        info!("Created {} peer connection with {} tracks", role, stream.tracks().len());
        Ok(negotiator)
    }
}

/// A negotiation object over one `RTCPeerConnection`
pub struct RtcNegotiator {
    pc: Arc<RTCPeerConnection>,
    events: NegotiationEvents,
    /// Remote candidates that arrived before the remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    destroyed: Arc<AtomicBool>,
}

impl RtcNegotiator {
    fn emit(&self, event: NegotiationEvent) {
        if !self.destroyed.load(Ordering::Acquire) {
            let _ = self.events.send(event);
        }
    }

    fn attach_handlers(&self) {
        let events = self.events.clone();
        let destroyed = self.destroyed.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let destroyed = destroyed.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("ICE gathering complete");
                        return;
                    };
                    if destroyed.load(Ordering::Acquire) {
                        return;
                    }
                    match candidate.to_json() {
                        Ok(init) => {
                            let payload = CandidatePayload::from(init);
                            let _ = events.send(NegotiationEvent::Signal(
                                json!({ "type": "candidate", "candidate": payload }),
                            ));
                        }
                        Err(e) => warn!("Failed to encode local candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        let destroyed = self.destroyed.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if !destroyed.load(Ordering::Acquire) {
                    info!("Remote track {} ({})", track.id(), track.stream_id());
                    let _ = events.send(NegotiationEvent::Stream(RemoteStream::from_rtc(track)));
                }
                Box::pin(async {})
            },
        ));

        let events = self.events.clone();
        let destroyed = self.destroyed.clone();
        let closed = Arc::new(AtomicBool::new(false));
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!("Peer connection state changed to: {}", state);
                if !destroyed.load(Ordering::Acquire) {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            let _ = events.send(NegotiationEvent::Connect);
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            if !closed.swap(true, Ordering::AcqRel) {
                                let _ = events.send(NegotiationEvent::Close);
                            }
                        }
                        _ => {}
                    }
                }
                Box::pin(async {})
            }));
    }

    /// Add local tracks and, for an initiator, produce the offer
    async fn prepare(&self, role: Role, stream: &LocalStream) -> Result<(), NegotiationError> {
        for track in stream.tracks() {
            let Some(rtc) = track.rtc() else {
                continue;
            };
            let local: Arc<dyn TrackLocal + Send + Sync> = rtc.clone();
            let sender = self.pc.add_track(local).await?;
            // Drain RTCP so interceptors keep running
            tokio::spawn(async move {
                let mut buf = vec![0u8; RTCP_BUFFER_LEN];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        if role == Role::Initiator {
            // Emit before setting it locally so the offer precedes any candidate
            let offer = self.pc.create_offer(None).await?;
            self.emit(NegotiationEvent::Signal(description_signal(
                "offer",
                offer.sdp.clone(),
            )));
            self.pc.set_local_description(offer).await?;
        }

        Ok(())
    }

    async fn apply_pending_candidates(&self) -> Result<(), NegotiationError> {
        let pending: Vec<_> = self.pending_candidates.lock().await.drain(..).collect();
        for candidate in pending {
            self.pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn feed_signal(&self, data: Value) -> Result<(), NegotiationError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }

        let payload: SignalPayload = serde_json::from_value(data)
            .map_err(|e| NegotiationError::Protocol(e.to_string()))?;

        match payload {
            SignalPayload::Offer { sdp } => {
                self.pc
                    .set_remote_description(RTCSessionDescription::offer(sdp)?)
                    .await?;
                self.apply_pending_candidates().await?;
                let answer = self.pc.create_answer(None).await?;
                self.emit(NegotiationEvent::Signal(description_signal(
                    "answer",
                    answer.sdp.clone(),
                )));
                self.pc.set_local_description(answer).await?;
            }
            SignalPayload::Answer { sdp } => {
                self.pc
                    .set_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await?;
                self.apply_pending_candidates().await?;
            }
            SignalPayload::Candidate { candidate } => {
                let init = RTCIceCandidateInit::from(candidate);
                if self.pc.remote_description().await.is_some() {
                    self.pc.add_ice_candidate(init).await?;
                } else {
                    debug!("Remote description not set yet, queuing candidate");
                    self.pending_candidates.lock().await.push(init);
                }
            }
            SignalPayload::Other => {
                debug!("Ignoring unsupported negotiation payload");
            }
        }
        Ok(())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
    }
}

/// Media source that produces negotiable VP8/Opus tracks without a capture
/// device, for headless clients
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticMediaSource;

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        let stream_id = format!("axi-{}", Uuid::new_v4());
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.clone(),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.clone(),
        ));

        Ok(LocalStream::with_id(
            stream_id,
            vec![
                MediaTrack::with_rtc(TrackKind::Video, "video", video),
                MediaTrack::with_rtc(TrackKind::Audio, "audio", audio),
            ],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_payload_uses_browser_field_names() {
        let payload = CandidatePayload::from(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        let value = json!({ "type": "candidate", "candidate": payload });
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(value["candidate"]["sdpMid"], "0");
    }

    #[test]
    fn payload_kinds_parse() {
        let offer: SignalPayload =
            serde_json::from_value(json!({"type": "offer", "sdp": "v=0"})).unwrap();
        assert!(matches!(offer, SignalPayload::Offer { .. }));

        let hint: SignalPayload =
            serde_json::from_value(json!({"type": "renegotiate", "renegotiate": true})).unwrap();
        assert!(matches!(hint, SignalPayload::Other));

        let broken = serde_json::from_value::<SignalPayload>(json!({"type": "answer"}));
        assert!(broken.is_err());
    }

    #[test]
    fn ice_servers_map_credentials() {
        let servers = rtc_ice_servers(&crate::config::default_ice_servers());
        assert_eq!(servers.len(), 8);
        assert_eq!(servers[5].username, "openrelayproject");
        assert!(servers[0].credential.is_empty());
    }

    #[tokio::test]
    async fn synthetic_source_yields_live_rtc_tracks() {
        let stream = SyntheticMediaSource.acquire().await.unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert!(stream.tracks().iter().all(|t| t.rtc().is_some()));
        assert!(stream.is_live());
    }

    #[tokio::test]
    async fn initiator_emits_offer_on_create() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = SyntheticMediaSource.acquire().await.unwrap();
        let negotiator = RtcNegotiatorFactory
            .create(Role::Initiator, stream, &[], tx)
            .await
            .unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            NegotiationEvent::Signal(data) => {
                assert_eq!(data["type"], "offer");
                assert!(data["sdp"].as_str().unwrap().starts_with("v=0"));
            }
            other => panic!("unexpected {other:?}"),
        }
        negotiator.destroy().await;
    }
}
