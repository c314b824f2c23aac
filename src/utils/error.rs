use std::error::Error as StdError;
use std::fmt;
use std::net::AddrParseError;
use std::time::Duration;

#[derive(Debug)]
pub enum Error {
    /// An operation was invoked on a connection before `create()` (or after `close()`).
    NotInitialized,
    ConnectionClosed,
    GatheringTimeout(Duration),
    NoCandidates,
    MissingLocalDescription,
    InvalidDescription(String),
    AmbiguousDescription(String),
    MalformedMessage(String),
    RoomNotFound(String),
    NodeNotFound(String),
    StreamNotFound(String),
    SelfForwarding { node_id: String, stream_id: String },
    Codec(String),
    Media(String),
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Json(serde_json::Error),
    IO(std::io::Error),
    AddrParse(AddrParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "connection not initialized"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::GatheringTimeout(d) => write!(f, "ICE gathering timeout after {:?}", d),
            Error::NoCandidates => write!(f, "no ICE candidates generated"),
            Error::MissingLocalDescription => write!(f, "local description is missing"),
            Error::InvalidDescription(e) => write!(f, "Invalid session description: {}", e),
            Error::AmbiguousDescription(e) => write!(f, "Cannot infer description type: {}", e),
            Error::MalformedMessage(e) => write!(f, "Malformed signaling message: {}", e),
            Error::RoomNotFound(id) => write!(f, "Room {} not found", id),
            Error::NodeNotFound(id) => write!(f, "Node {} not found", id),
            Error::StreamNotFound(id) => write!(f, "Stream {} not found", id),
            Error::SelfForwarding { node_id, stream_id } => {
                write!(f, "Node {} cannot forward its own stream {}", node_id, stream_id)
            }
            Error::Codec(e) => write!(f, "Codec error: {}", e),
            Error::Media(e) => write!(f, "Media error: {}", e),
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::IO(e) => write!(f, "IO error: {}", e),
            Error::AddrParse(e) => write!(f, "Address parse error: {}", e),
        }
    }
}

impl StdError for Error {}

impl Error {
    /// Errors a session survives: the offending message is dropped and the loop continues.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::Json(_)
                | Error::InvalidDescription(_)
                | Error::AmbiguousDescription(_)
                | Error::RoomNotFound(_)
                | Error::NodeNotFound(_)
                | Error::StreamNotFound(_)
                | Error::SelfForwarding { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json(error)
    }
}

impl From<webrtc::Error> for Error {
    fn from(error: webrtc::Error) -> Self {
        Error::Media(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<AddrParseError> for Error {
    fn from(error: AddrParseError) -> Self {
        Error::AddrParse(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
