use crate::rtc::codec::{CodecKind, CodecSelector};
use crate::rtc::peer::PeerConnection;
use crate::types::{ConnectionState, MediaType};
use crate::utils::{Error, Result};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const VIDEO_FRAME_DURATION: Duration = Duration::from_millis(33);
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub enum MediaPacket {
    Audio(Bytes),
    Video(Bytes),
}

impl MediaPacket {
    pub fn payload(&self) -> &Bytes {
        match self {
            MediaPacket::Audio(data) | MediaPacket::Video(data) => data,
        }
    }

    pub fn media_type(&self) -> MediaType {
        match self {
            MediaPacket::Audio(_) => MediaType::Audio,
            MediaPacket::Video(_) => MediaType::Video,
        }
    }
}

#[derive(Default)]
struct Tracks {
    audio_tx: Option<Arc<TrackLocalStaticSample>>,
    video_tx: Option<Arc<TrackLocalStaticSample>>,
    audio_rx: Option<Arc<TrackRemote>>,
    video_rx: Option<Arc<TrackRemote>>,
}

pub struct TrackManager {
    stream_id: String,
    codecs: CodecSelector,
    tracks: RwLock<Tracks>,
}

impl TrackManager {
    pub fn new(stream_id: impl Into<String>, codecs: CodecSelector) -> Self {
        Self {
            stream_id: stream_id.into(),
            codecs,
            tracks: RwLock::new(Tracks::default()),
        }
    }

    pub async fn create_audio_tx_track(
        &self,
        connection: &PeerConnection,
    ) -> Result<Arc<TrackLocalStaticSample>> {
        let track = self.add_local_track(connection, self.codecs.codec(), "audio").await?;
        self.tracks.write().audio_tx = Some(track.clone());
        Ok(track)
    }

    pub async fn create_video_tx_track(
        &self,
        connection: &PeerConnection,
        codec: CodecKind,
    ) -> Result<Arc<TrackLocalStaticSample>> {
        if !codec.is_video() {
            return Err(Error::Codec(format!("{} is not a video codec", codec)));
        }
        let track = self.add_local_track(connection, codec, "video").await?;
        self.tracks.write().video_tx = Some(track.clone());
        Ok(track)
    }

    async fn add_local_track(
        &self,
        connection: &PeerConnection,
        codec: CodecKind,
        id: &str,
    ) -> Result<Arc<TrackLocalStaticSample>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            codec.capability(),
            id.to_string(),
            self.stream_id.clone(),
        ));
        connection
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        info!("Added local {} track ({}) to stream {}", id, codec, self.stream_id);
        Ok(track)
    }

    pub fn on_remote_track(&self, track: Arc<TrackRemote>) {
        let mut tracks = self.tracks.write();
        match track.kind() {
            RTPCodecType::Audio => tracks.audio_rx = Some(track),
            RTPCodecType::Video => tracks.video_rx = Some(track),
            other => warn!("Ignoring remote track of kind {}", other),
        }
    }

    pub fn has_remote_track(&self) -> bool {
        let tracks = self.tracks.read();
        tracks.audio_rx.is_some() || tracks.video_rx.is_some()
    }

    /// Feeds tracks announced by the connection into this manager until the sender goes away.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<Arc<TrackRemote>>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(track) = incoming.recv().await {
                manager.on_remote_track(track);
            }
            debug!("Remote track listener finished");
        })
    }

    /// Writes one packet to the matching local track. Returns the bytes written,
    /// zero when no such track exists yet.
    pub async fn send(&self, packet: &MediaPacket) -> Result<usize> {
        let track = {
            let tracks = self.tracks.read();
            match packet {
                MediaPacket::Audio(_) => tracks.audio_tx.clone(),
                MediaPacket::Video(_) => tracks.video_tx.clone(),
            }
        };
        let Some(track) = track else {
            return Ok(0);
        };

        let data = packet.payload().clone();
        let duration = match packet {
            MediaPacket::Video(_) => VIDEO_FRAME_DURATION,
            MediaPacket::Audio(_) => {
                let per_ms = self.codecs.config().bytes_per_ms().max(1);
                Duration::from_millis((data.len() / per_ms) as u64)
            }
        };
        let len = data.len();
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(len)
    }

    /// Reads the next RTP payload from the remote side. Yields `None` while there is
    /// no remote track or the connection is not up.
    pub async fn next(&self, state: ConnectionState) -> Result<Option<MediaPacket>> {
        let remote = {
            let tracks = self.tracks.read();
            tracks
                .audio_rx
                .clone()
                .map(|t| (t, MediaType::Audio))
                .or_else(|| tracks.video_rx.clone().map(|t| (t, MediaType::Video)))
        };

        let (track, media_type) = match remote {
            Some(remote) if state == ConnectionState::Connected => remote,
            _ => {
                tokio::time::sleep(IDLE_BACKOFF).await;
                return Ok(None);
            }
        };

        let (packet, _) = track.read_rtp().await?;
        Ok(Some(match media_type {
            MediaType::Audio => MediaPacket::Audio(packet.payload),
            MediaType::Video => MediaPacket::Video(packet.payload),
        }))
    }

    pub fn close(&self) {
        *self.tracks.write() = Tracks::default();
    }
}
