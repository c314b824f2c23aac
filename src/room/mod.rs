pub mod node;
pub mod state;
pub mod stream;

pub use node::{MediaTransportHandle, Node, NodeCapabilities, NodeSnapshot};
pub use state::{Room, RoomSnapshot};
pub use stream::{BufferedPacket, Stream, StreamBuffer, StreamSnapshot};
