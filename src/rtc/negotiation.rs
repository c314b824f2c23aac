use crate::rtc::peer::PeerConnection;
use crate::utils::{preview, Error, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SETTLE_DELAY: Duration = Duration::from_millis(200);
const SDP_PREVIEW_CHARS: usize = 100;

/// A gathered local description together with the candidates discovered for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDescription {
    pub sdp: String,
    pub candidates: Vec<String>,
}

#[derive(Deserialize)]
struct DescriptionEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    sdp: String,
}

/// Drives offer/answer against one peer connection. Operations are serialized.
pub struct NegotiationCoordinator {
    connection: Arc<PeerConnection>,
    ice_timeout: Duration,
    poll_interval: Duration,
    settle_delay: Duration,
    offer_sdp: Mutex<Option<String>>,
    answer_sdp: Mutex<Option<String>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl NegotiationCoordinator {
    pub fn new(connection: Arc<PeerConnection>, ice_timeout: Duration) -> Self {
        Self {
            connection,
            ice_timeout,
            poll_interval: POLL_INTERVAL,
            settle_delay: SETTLE_DELAY,
            offer_sdp: Mutex::new(None),
            answer_sdp: Mutex::new(None),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn ice_timeout(&self) -> Duration {
        self.ice_timeout
    }

    pub fn offer_sdp(&self) -> Option<String> {
        self.offer_sdp.lock().clone()
    }

    pub fn answer_sdp(&self) -> Option<String> {
        self.answer_sdp.lock().clone()
    }

    pub async fn create_offer(&self) -> Result<LocalDescription> {
        let _turn = self.in_flight.lock().await;

        let offer = self.connection.create_offer().await.map_err(|e| {
            error!("Failed to create offer: {}", e);
            e
        })?;
        self.connection.set_local_description(offer).await?;
        self.wait_for_gathering().await?;

        let local = self.collect_local().await?;
        info!(
            "Created offer with {} candidates: {}",
            local.candidates.len(),
            preview(&local.sdp, SDP_PREVIEW_CHARS)
        );
        *self.offer_sdp.lock() = Some(local.sdp.clone());
        Ok(local)
    }

    /// Answers the applied remote offer. Remote candidates that fail to apply are
    /// logged and skipped.
    pub async fn create_answer(&self, remote_candidates: &[String]) -> Result<LocalDescription> {
        let _turn = self.in_flight.lock().await;

        let answer = self.connection.create_answer().await.map_err(|e| {
            error!("Failed to create answer: {}", e);
            e
        })?;
        self.connection.set_local_description(answer).await?;

        for candidate in remote_candidates {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!("Failed to add remote ICE candidate {}: {}", candidate, e);
            }
        }

        self.wait_for_gathering().await?;

        let local = self.collect_local().await?;
        info!(
            "Created answer with {} candidates: {}",
            local.candidates.len(),
            preview(&local.sdp, SDP_PREVIEW_CHARS)
        );
        *self.answer_sdp.lock() = Some(local.sdp.clone());
        Ok(local)
    }

    /// Applies a remote description given either as a `{"type","sdp"}` JSON envelope
    /// or as bare SDP text. Without an explicit type the signaling state decides.
    pub async fn set_remote_description(&self, payload: &str) -> Result<RTCSdpType> {
        let _turn = self.in_flight.lock().await;

        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidDescription("empty SDP".to_string()));
        }

        let (kind, sdp) = match serde_json::from_str::<DescriptionEnvelope>(trimmed) {
            Ok(envelope) => (envelope.kind.filter(|k| !k.is_empty()), envelope.sdp),
            Err(_) => (None, trimmed.to_string()),
        };
        if sdp.trim().is_empty() {
            return Err(Error::InvalidDescription("empty SDP".to_string()));
        }

        let sdp_type = match kind {
            Some(kind) => parse_sdp_type(&kind)?,
            None => infer_sdp_type(self.connection.signaling_state()?)?,
        };

        debug!(
            "Applying remote {} (audio: {}): {}",
            sdp_type,
            sdp.contains("m=audio"),
            preview(&sdp, SDP_PREVIEW_CHARS)
        );

        let desc = match sdp_type {
            RTCSdpType::Offer => RTCSessionDescription::offer(sdp),
            RTCSdpType::Answer => RTCSessionDescription::answer(sdp),
            RTCSdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
            other => return Err(Error::InvalidDescription(format!("unsupported type {}", other))),
        }
        .map_err(|e| Error::InvalidDescription(e.to_string()))?;

        self.connection.set_remote_description(desc).await?;
        Ok(sdp_type)
    }

    /// Waits until at least one local candidate exists and trailing candidates have
    /// had `settle_delay` to arrive. Closing the connection aborts the wait.
    async fn wait_for_gathering(&self) -> Result<()> {
        let mut closed = self.connection.closed_watch();
        let deadline = tokio::time::sleep(self.ice_timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut first_seen: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("ICE gathering timed out after {:?}", self.ice_timeout);
                    return Err(Error::GatheringTimeout(self.ice_timeout));
                }
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        return Err(Error::ConnectionClosed);
                    }
                }
                _ = ticker.tick() => {
                    if *closed.borrow() {
                        return Err(Error::ConnectionClosed);
                    }
                    let count = self.connection.candidate_count();
                    let complete = self.connection.gathering_complete();
                    if count == 0 {
                        if complete {
                            return Err(Error::NoCandidates);
                        }
                        continue;
                    }
                    let since = *first_seen.get_or_insert_with(Instant::now);
                    if complete || since.elapsed() >= self.settle_delay {
                        debug!("ICE gathering settled with {} candidates", count);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn collect_local(&self) -> Result<LocalDescription> {
        let candidates = self.connection.candidates();
        if candidates.is_empty() {
            return Err(Error::NoCandidates);
        }
        let desc = self
            .connection
            .local_description()
            .await
            .ok_or(Error::MissingLocalDescription)?;
        Ok(LocalDescription {
            sdp: desc.sdp,
            candidates,
        })
    }
}

pub fn parse_sdp_type(kind: &str) -> Result<RTCSdpType> {
    match kind.to_ascii_lowercase().as_str() {
        "offer" => Ok(RTCSdpType::Offer),
        "answer" => Ok(RTCSdpType::Answer),
        "pranswer" => Ok(RTCSdpType::Pranswer),
        other => Err(Error::InvalidDescription(format!("unknown type {}", other))),
    }
}

/// With no local offer outstanding the remote side is offering; after we offered it
/// must be answering. Any other state cannot be resolved without a type.
pub fn infer_sdp_type(state: RTCSignalingState) -> Result<RTCSdpType> {
    match state {
        RTCSignalingState::Stable => Ok(RTCSdpType::Offer),
        RTCSignalingState::HaveLocalOffer => Ok(RTCSdpType::Answer),
        other => Err(Error::AmbiguousDescription(format!("signaling state {}", other))),
    }
}
