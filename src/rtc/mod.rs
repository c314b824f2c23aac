pub mod codec;
pub mod negotiation;
pub mod options;
pub mod peer;
pub mod track;
pub mod transport;

pub use codec::{CodecConfig, CodecKind, CodecSelector};
pub use negotiation::{LocalDescription, NegotiationCoordinator};
pub use options::{IceServer, WebRtcOption};
pub use peer::{ConnectionEvent, PeerConnection};
pub use track::{MediaPacket, TrackManager};
pub use transport::SessionTransport;
