pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod rtc;
pub mod sfu;
pub mod signaling;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use config::{ServerConfig, SfuConfig};
pub use room::{Node, Room, Stream};
pub use rtc::SessionTransport;
pub use sfu::{CentralNode, RoleAssigner};
pub use signaling::SignalingServer;
pub use types::{Role, RoleAssignment};
pub use utils::{Error, Result};
