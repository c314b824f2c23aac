use crate::media::{MediaPipeline, PassthroughPipeline};
use crate::room::MediaTransportHandle;
use crate::rtc::codec::{preferred_audio_codec, CodecConfig, CodecKind, CodecSelector};
use crate::rtc::negotiation::{LocalDescription, NegotiationCoordinator};
use crate::rtc::options::WebRtcOption;
use crate::rtc::peer::PeerConnection;
use crate::rtc::track::{MediaPacket, TrackManager};
use crate::types::ConnectionState;
use crate::utils::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

/// One peer's media path: connection, negotiation, tracks and the media pipeline.
pub struct SessionTransport {
    options: WebRtcOption,
    codecs: CodecSelector,
    connection: Arc<PeerConnection>,
    negotiation: NegotiationCoordinator,
    tracks: Arc<TrackManager>,
    pipeline: Arc<dyn MediaPipeline>,
    track_listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTransport {
    pub fn new(options: WebRtcOption) -> Self {
        Self::with_pipeline(options, Arc::new(PassthroughPipeline))
    }

    pub fn with_pipeline(options: WebRtcOption, pipeline: Arc<dyn MediaPipeline>) -> Self {
        let options = options.with_defaults();
        let codecs = CodecSelector::new(&options.codec);
        let connection = Arc::new(PeerConnection::new(&options));
        let negotiation = NegotiationCoordinator::new(connection.clone(), options.ice_timeout());
        let tracks = Arc::new(TrackManager::new(options.stream_id.clone(), codecs.clone()));
        Self {
            options,
            codecs,
            connection,
            negotiation,
            tracks,
            pipeline,
            track_listener: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &WebRtcOption {
        &self.options
    }

    pub fn codec(&self) -> CodecKind {
        self.codecs.codec()
    }

    pub fn codec_config(&self) -> CodecConfig {
        self.codecs.config()
    }

    pub fn connection(&self) -> &Arc<PeerConnection> {
        &self.connection
    }

    pub fn track_manager(&self) -> &Arc<TrackManager> {
        &self.tracks
    }

    /// Creates the underlying connection and starts routing remote tracks to the
    /// track manager.
    pub async fn new_peer_connection(&self) -> Result<()> {
        self.connection.create().await?;
        let incoming = self.connection.subscribe_tracks();
        let listener = self.tracks.spawn_listener(incoming);
        if let Some(previous) = self.track_listener.lock().replace(listener) {
            previous.abort();
        }
        info!("Session transport ready: {}", self.options);
        Ok(())
    }

    pub async fn create_audio_track(&self) -> Result<()> {
        self.tracks.create_audio_tx_track(&self.connection).await?;
        Ok(())
    }

    pub async fn create_video_track(&self, codec: CodecKind) -> Result<()> {
        self.tracks.create_video_tx_track(&self.connection, codec).await?;
        Ok(())
    }

    pub async fn set_remote_description(&self, payload: &str) -> Result<RTCSdpType> {
        self.negotiation.set_remote_description(payload).await
    }

    pub async fn create_offer(&self) -> Result<LocalDescription> {
        self.negotiation.create_offer().await
    }

    pub async fn create_answer(&self, remote_candidates: &[String]) -> Result<LocalDescription> {
        self.negotiation.create_answer(remote_candidates).await
    }

    pub async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        self.connection.add_ice_candidate(candidate).await
    }

    pub fn offer_sdp(&self) -> Option<String> {
        self.negotiation.offer_sdp()
    }

    pub fn answer_sdp(&self) -> Option<String> {
        self.negotiation.answer_sdp()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn signaling_state(&self) -> Result<RTCSignalingState> {
        self.connection.signaling_state()
    }

    /// The audio format the negotiated local description settled on.
    pub async fn select_preferred_codec(&self) -> Result<CodecConfig> {
        let local = self
            .connection
            .local_description()
            .await
            .ok_or(Error::MissingLocalDescription)?;
        preferred_audio_codec(&local.sdp)
    }

    pub async fn send(&self, packet: &MediaPacket) -> Result<usize> {
        self.tracks.send(packet).await
    }

    /// Runs `payload` through the pipeline into this transport's codec and sends
    /// every resulting frame.
    pub async fn send_payload(&self, payload: Bytes, source: &CodecConfig) -> Result<usize> {
        let target = self.codecs.config();
        let mut written = 0;
        for frame in self.pipeline.transcode(payload, source, &target)? {
            written += self.tracks.send(&MediaPacket::Audio(frame)).await?;
        }
        Ok(written)
    }

    pub async fn next(&self) -> Result<Option<MediaPacket>> {
        self.tracks.next(self.connection.state()).await
    }

    /// Lossy: only callers already waiting when the connection drops are woken.
    pub async fn stopped(&self) {
        self.connection.stopped().await
    }

    /// Tears down tracks and the connection. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        if let Some(listener) = self.track_listener.lock().take() {
            listener.abort();
        }
        self.tracks.close();
        self.connection.close().await.map_err(|e| {
            warn!("Error closing peer connection: {}", e);
            e
        })
    }
}

#[async_trait]
impl MediaTransportHandle for SessionTransport {
    fn connection_state(&self) -> ConnectionState {
        SessionTransport::connection_state(self)
    }

    async fn close(&self) -> Result<()> {
        SessionTransport::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn defaults_applied_on_construction() {
        let transport = SessionTransport::new(WebRtcOption::default());
        assert_eq!(transport.codec(), CodecKind::Opus);
        assert_eq!(transport.options().stream_id, "selective-relay");
        assert_eq!(transport.connection_state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn close_without_connection_is_ok() {
        let transport = SessionTransport::new(WebRtcOption::default());
        assert_ok!(transport.close().await);
        assert_ok!(transport.close().await);
    }

    #[tokio::test]
    async fn preferred_codec_needs_local_description() {
        let transport = SessionTransport::new(WebRtcOption::default());
        assert_ok!(transport.new_peer_connection().await);
        assert!(matches!(
            transport.select_preferred_codec().await,
            Err(Error::MissingLocalDescription)
        ));
        assert_ok!(transport.close().await);
        assert_eq!(transport.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn handle_trait_delegates() {
        let transport: Arc<dyn MediaTransportHandle> =
            Arc::new(SessionTransport::new(WebRtcOption::default()));
        assert_eq!(transport.connection_state(), ConnectionState::New);
        assert_ok!(transport.close().await);
        assert_eq!(transport.connection_state(), ConnectionState::Closed);
    }
}
