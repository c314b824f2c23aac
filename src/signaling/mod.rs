pub mod connection_state;
pub mod handler;
pub mod messages;
pub mod server;

pub use connection_state::{SessionState, SessionStateManager};
pub use handler::{SessionHandler, SignalingContext};
pub use messages::SignalMessage;
pub use server::{run_debug_server, SignalingServer};
