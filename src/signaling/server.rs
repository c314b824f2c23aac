use crate::signaling::handler::{SessionHandler, SignalingContext};
use crate::signaling::messages::SignalMessage;
use crate::utils::Result;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use warp::Filter;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct SignalingServer {
    address: String,
    ctx: Arc<SignalingContext>,
}

impl SignalingServer {
    pub fn new(address: &str, ctx: Arc<SignalingContext>) -> Self {
        Self {
            address: address.to_string(),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<SignalingContext> {
        &self.ctx
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            error!("Failed to bind to {}: {}", self.address, e);
            e
        })?;
        info!("Signaling server listening on {}", self.address);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            info!("New connection from: {}", addr);
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    error!("Error handling connection from {}: {}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<SignalingContext>,
    ) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {} message: {}", message.message_type, e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    debug!("WebSocket send failed: {}", e);
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut handler = SessionHandler::start(ctx, tx).await?;

        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if let Err(e) = handler.handle_text(&text).await {
                        error!("Session {} failed: {}", handler.session_id(), e);
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error from {}: {}", addr, e);
                    break;
                }
            }
        }

        info!("Connection from {} closed", addr);
        handler.finish().await;
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            debug!("Writer for {} did not drain in time", addr);
        }
        Ok(())
    }
}

fn with_context(
    ctx: Arc<SignalingContext>,
) -> impl Filter<Extract = (Arc<SignalingContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// Read-only JSON views of rooms and sessions.
pub fn debug_routes(
    ctx: Arc<SignalingContext>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let rooms = warp::path!("debug" / "rooms")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .and_then(|ctx: Arc<SignalingContext>| async move {
            let snapshot = ctx.central.snapshot().await;
            Ok::<_, Infallible>(warp::reply::json(&snapshot))
        });

    let sessions = warp::path!("debug" / "sessions")
        .and(warp::get())
        .and(with_context(ctx))
        .and_then(|ctx: Arc<SignalingContext>| async move {
            let summary = ctx.states.summary().await;
            Ok::<_, Infallible>(warp::reply::json(&summary))
        });

    rooms.or(sessions)
}

pub async fn run_debug_server(ctx: Arc<SignalingContext>, port: u16) {
    info!("Debug endpoint listening on 0.0.0.0:{}", port);
    warp::serve(debug_routes(ctx)).run(([0, 0, 0, 0], port)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::room::NodeCapabilities;
    use crate::rtc::options::WebRtcOption;
    use crate::sfu::CentralNode;

    fn context() -> Arc<SignalingContext> {
        let central = Arc::new(CentralNode::new("central", SfuConfig::default()));
        Arc::new(SignalingContext::new(central, WebRtcOption::default()))
    }

    #[tokio::test]
    async fn rooms_endpoint_lists_nodes() {
        let ctx = context();
        ctx.central
            .join("r", "a", "ua", NodeCapabilities::default())
            .await
            .unwrap();

        let res = warp::test::request()
            .method("GET")
            .path("/debug/rooms")
            .reply(&debug_routes(ctx))
            .await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body[0]["id"], "r");
        assert_eq!(body[0]["nodes"][0]["role"], "RECEIVER");
    }

    #[tokio::test]
    async fn sessions_endpoint_reports_summary() {
        let ctx = context();
        let res = warp::test::request()
            .method("GET")
            .path("/debug/sessions")
            .reply(&debug_routes(ctx))
            .await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["total_sessions"], 0);
    }

    #[tokio::test]
    async fn unknown_debug_path_is_404() {
        let res = warp::test::request()
            .path("/debug/nothing")
            .reply(&debug_routes(context()))
            .await;
        assert_eq!(res.status(), 404);
    }
}
