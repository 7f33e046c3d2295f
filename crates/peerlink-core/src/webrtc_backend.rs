//! [`MediaBackend`] over the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use peerlink_common::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::resource::{
    MediaBackend, PeerResource, RemoteStream, ResourceConfig, ResourceError, ResourceEvent,
    ResourceResult,
};

const LOCAL_STREAM_ID: &str = "peerlink";

impl From<webrtc::Error> for ResourceError {
    fn from(err: webrtc::Error) -> Self {
        ResourceError::new(err)
    }
}

pub struct WebRtcBackend {
    api: API,
}

impl WebRtcBackend {
    pub fn new() -> ResourceResult<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(m).build();
        Ok(Self { api })
    }
}

fn local_track(mime_type: &str, id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            ..Default::default()
        },
        id.to_string(),
        LOCAL_STREAM_ID.to_string(),
    ))
}

/// Attach a local track for `kind`, or a receive-only transceiver when local
/// capture of that kind is disabled.
async fn attach_media(
    pc: &RTCPeerConnection,
    kind: RTPCodecType,
    send: bool,
) -> ResourceResult<()> {
    if send {
        let (mime_type, id) = match kind {
            RTPCodecType::Audio => (MIME_TYPE_OPUS, "audio"),
            _ => (MIME_TYPE_VP8, "video"),
        };
        let track = local_track(mime_type, id);
        pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>).await?;
    } else {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;
    }
    Ok(())
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn create_resource(
        &self,
        config: &ResourceConfig,
        events: mpsc::UnboundedSender<ResourceEvent>,
    ) -> ResourceResult<Arc<dyn PeerResource>> {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);

        attach_media(&pc, RTPCodecType::Audio, config.local_media.audio).await?;
        attach_media(&pc, RTPCodecType::Video, config.local_media.video).await?;

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |c| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(ResourceEvent::CandidateGathered(IceCandidate {
                            media_line_index: init.sdp_mline_index.unwrap_or(0),
                            media_id: init.sdp_mid.unwrap_or_default(),
                            candidate: init.candidate,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = events.clone();
            Box::pin(async move {
                let _ = tx.send(ResourceEvent::RemoteStreamAdded(RemoteStream {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    kind: track.kind().to_string(),
                }));
            })
        }));

        info!(
            audio = config.local_media.audio,
            video = config.local_media.video,
            "WebRTC peer connection created"
        );
        Ok(Arc::new(WebRtcResource { pc }))
    }
}

pub struct WebRtcResource {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(description: &SessionDescription) -> ResourceResult<RTCSessionDescription> {
    let sdp = description.body.clone();
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
    };
    Ok(rtc)
}

#[async_trait]
impl PeerResource for WebRtcResource {
    async fn create_offer(&self) -> ResourceResult<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> ResourceResult<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> ResourceResult<()> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> ResourceResult<()> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> ResourceResult<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: Some(candidate.media_id.clone()),
                sdp_mline_index: Some(candidate.media_line_index),
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn dispose(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalMedia;

    #[tokio::test]
    async fn test_disabled_capture_offers_receive_only() {
        let backend = WebRtcBackend::new().unwrap();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let config = ResourceConfig {
            ice_servers: Vec::new(),
            local_media: LocalMedia {
                audio: true,
                video: false,
            },
        };
        let resource = backend.create_resource(&config, events).await.unwrap();

        let offer = resource.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.body.contains("m=audio"), "{}", offer.body);
        assert!(offer.body.contains("m=video"), "{}", offer.body);
        assert!(offer.body.contains("a=recvonly"), "{}", offer.body);

        resource.dispose().await;
    }
}
