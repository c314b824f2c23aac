use crate::rtc::codec::CodecSelector;
use crate::rtc::options::WebRtcOption;
use crate::types::ConnectionState;
use crate::utils::{Error, Result};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Everything the engine reports, delivered in order through one channel per connection.
pub enum ConnectionEvent {
    CandidateDiscovered(RTCIceCandidateInit),
    GatheringComplete,
    StateChanged(RTCPeerConnectionState),
    TrackArrived(Arc<TrackRemote>),
}

/// One-shot, lossy wake-up: fires at most once and only reaches tasks already waiting.
#[derive(Default)]
struct StopSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }
}

/// State touched both by the event loop and by callers; every path goes through these locks.
#[derive(Default)]
struct Shared {
    candidates: Mutex<Vec<RTCIceCandidateInit>>,
    gathering_complete: AtomicBool,
    stop: StopSignal,
    track_sink: Mutex<Option<mpsc::UnboundedSender<Arc<TrackRemote>>>>,
}

/// Thin wrapper around one webrtc-rs peer connection.
pub struct PeerConnection {
    ice_servers: Vec<RTCIceServer>,
    codecs: CodecSelector,
    pc: RwLock<Option<Arc<RTCPeerConnection>>>,
    shared: Arc<Shared>,
    closed: watch::Sender<bool>,
    lifecycle: tokio::sync::Mutex<()>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    pub fn new(opt: &WebRtcOption) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            ice_servers: opt.rtc_ice_servers(),
            codecs: CodecSelector::new(&opt.codec),
            pc: RwLock::new(None),
            shared: Arc::new(Shared::default()),
            closed,
            lifecycle: tokio::sync::Mutex::new(()),
            event_task: Mutex::new(None),
        }
    }

    /// Instantiates the engine and wires its callbacks into the event channel.
    /// Calling it again on a live connection is a no-op.
    pub async fn create(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if *self.closed.borrow() {
            return Err(Error::ConnectionClosed);
        }
        if self.pc.read().is_some() {
            return Ok(());
        }

        let mut media_engine = self.codecs.media_engine()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (tx, rx) = mpsc::unbounded_channel();
        register_callbacks(&pc, tx);
        let task = tokio::spawn(run_event_loop(rx, self.shared.clone()));

        *self.event_task.lock() = Some(task);
        *self.pc.write() = Some(pc);
        debug!("Peer connection created with {} ICE servers", self.ice_servers.len());
        Ok(())
    }

    fn engine(&self) -> Result<Arc<RTCPeerConnection>> {
        self.pc.read().clone().ok_or(Error::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.pc.read().is_some()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Flips to `true` exactly once, when the connection is closed.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Resolves when the engine reports disconnected/failed/closed, but only if this
    /// future was already waiting at that moment. Pair it with `state()` polling.
    pub async fn stopped(&self) {
        self.shared.stop.notify.notified().await
    }

    pub fn candidates(&self) -> Vec<String> {
        self.shared
            .candidates
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn candidate_count(&self) -> usize {
        self.shared.candidates.lock().len()
    }

    pub fn gathering_complete(&self) -> bool {
        self.shared.gathering_complete.load(Ordering::SeqCst)
    }

    fn reset_gathering(&self) {
        self.shared.candidates.lock().clear();
        self.shared.gathering_complete.store(false, Ordering::SeqCst);
    }

    /// Remote tracks are pushed into the returned channel; a later call replaces the sink.
    pub fn subscribe_tracks(&self) -> mpsc::UnboundedReceiver<Arc<TrackRemote>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.track_sink.lock() = Some(tx);
        rx
    }

    pub async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        let pc = self.engine()?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.to_string(),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        match self.pc.read().as_ref() {
            Some(pc) => pc.connection_state().into(),
            None if self.is_closed() => ConnectionState::Closed,
            None => ConnectionState::New,
        }
    }

    pub fn signaling_state(&self) -> Result<RTCSignalingState> {
        Ok(self.engine()?.signaling_state())
    }

    pub async fn local_description(&self) -> Option<RTCSessionDescription> {
        let pc = self.pc.read().clone()?;
        pc.local_description().await
    }

    /// Starts a new gathering round, so candidates from an earlier round are dropped first.
    pub async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        let pc = self.engine()?;
        self.reset_gathering();
        pc.set_local_description(desc).await?;
        Ok(())
    }

    pub async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        let pc = self.engine()?;
        pc.set_remote_description(desc)
            .await
            .map_err(|e| Error::InvalidDescription(e.to_string()))
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let pc = self.engine()?;
        Ok(pc.create_offer(None).await?)
    }

    pub async fn create_answer(&self) -> Result<RTCSessionDescription> {
        let pc = self.engine()?;
        Ok(pc.create_answer(None).await?)
    }

    pub async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>> {
        let pc = self.engine()?;
        Ok(pc.add_track(track).await?)
    }

    /// Idempotent. Releases the candidate list and stop signal once, unblocks gathering
    /// waits, then closes the engine. Only the first call can surface an engine error.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let already_closed = self.closed.send_replace(true);
        let pc = self.pc.write().take();
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }

        if !already_closed {
            self.shared.candidates.lock().clear();
            self.shared.track_sink.lock().take();
            self.shared.stop.fire();
        }

        match pc {
            Some(pc) => {
                info!("Closing peer connection");
                pc.close().await.map_err(Error::from)
            }
            None => Ok(()),
        }
    }
}

fn register_callbacks(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<ConnectionEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let event = match candidate {
                Some(c) => match c.to_json() {
                    Ok(init) => ConnectionEvent::CandidateDiscovered(init),
                    Err(e) => {
                        warn!("Could not serialize local ICE candidate: {}", e);
                        return;
                    }
                },
                None => ConnectionEvent::GatheringComplete,
            };
            let _ = tx.send(event);
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = tx.send(ConnectionEvent::StateChanged(state));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let _ = tx.send(ConnectionEvent::TrackArrived(track));
            Box::pin(async {})
        },
    ));
}

async fn run_event_loop(mut events: mpsc::UnboundedReceiver<ConnectionEvent>, shared: Arc<Shared>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::CandidateDiscovered(init) => {
                debug!("ICE candidate generated: {}", init.candidate);
                shared.candidates.lock().push(init);
            }
            ConnectionEvent::GatheringComplete => {
                debug!("ICE gathering complete");
                shared.gathering_complete.store(true, Ordering::SeqCst);
            }
            ConnectionEvent::StateChanged(state) => {
                debug!("Connection state changed: {}", state);
                match state {
                    RTCPeerConnectionState::Connected => info!("Connection established"),
                    RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed => {
                        info!("Connection stopped: {}", state);
                        shared.stop.fire();
                    }
                    _ => {}
                }
            }
            ConnectionEvent::TrackArrived(track) => {
                info!("Received remote {} track, ssrc={}", track.kind(), track.ssrc());
                if let Some(sink) = shared.track_sink.lock().as_ref() {
                    let _ = sink.send(track);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn offline_option() -> WebRtcOption {
        WebRtcOption::default().with_defaults()
    }

    #[tokio::test]
    async fn operations_before_create_fail() {
        let conn = PeerConnection::new(&offline_option());
        assert!(matches!(conn.create_offer().await, Err(Error::NotInitialized)));
        assert!(matches!(conn.create_answer().await, Err(Error::NotInitialized)));
        assert!(matches!(
            conn.add_ice_candidate("candidate:1 1 udp 1 10.0.0.1 5000 typ host").await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(conn.signaling_state(), Err(Error::NotInitialized)));
        assert_eq!(conn.state(), ConnectionState::New);
        assert!(conn.local_description().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let never_created = PeerConnection::new(&offline_option());
        assert_ok!(never_created.close().await);
        assert_ok!(never_created.close().await);

        let conn = PeerConnection::new(&offline_option());
        assert_ok!(conn.create().await);
        assert!(conn.is_initialized());
        for _ in 0..3 {
            assert_ok!(conn.close().await);
        }
        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.create_offer().await, Err(Error::NotInitialized)));
        assert!(conn.candidates().is_empty());
    }

    #[tokio::test]
    async fn create_after_close_is_rejected() {
        let conn = PeerConnection::new(&offline_option());
        assert_ok!(conn.close().await);
        assert_err!(conn.create().await);
    }

    #[tokio::test]
    async fn create_twice_keeps_one_engine() {
        let conn = PeerConnection::new(&offline_option());
        assert_ok!(conn.create().await);
        assert_ok!(conn.create().await);
        assert_eq!(conn.signaling_state().unwrap(), RTCSignalingState::Stable);
        assert_ok!(conn.close().await);
    }

    #[tokio::test]
    async fn close_wakes_stop_listener_once() {
        let conn = Arc::new(PeerConnection::new(&offline_option()));
        assert_ok!(conn.create().await);

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ok!(conn.close().await);
        let joined = assert_ok!(tokio::time::timeout(Duration::from_secs(1), waiter).await);
        assert_ok!(joined);
    }

    #[tokio::test]
    async fn new_local_description_drops_previous_candidates() {
        let conn = PeerConnection::new(&offline_option());
        assert_ok!(conn.create().await);
        conn.shared.candidates.lock().push(RTCIceCandidateInit {
            candidate: "candidate:stale".to_string(),
            ..Default::default()
        });
        conn.shared.gathering_complete.store(true, Ordering::SeqCst);

        let offer = assert_ok!(conn.create_offer().await);
        assert_ok!(conn.set_local_description(offer).await);
        assert!(!conn.candidates().contains(&"candidate:stale".to_string()));
        assert_ok!(conn.close().await);
    }

    #[tokio::test]
    async fn closed_watch_flips_on_close() {
        let conn = PeerConnection::new(&offline_option());
        let mut closed = conn.closed_watch();
        assert!(!*closed.borrow());
        assert_ok!(conn.close().await);
        assert_ok!(closed.changed().await);
        assert!(*closed.borrow());
    }
}
