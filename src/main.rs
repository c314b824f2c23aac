use anyhow::Result;
use clap::{Arg, Command};
use log::info;
use selective_relay::config::ServerConfig;
use selective_relay::sfu::CentralNode;
use selective_relay::signaling::{run_debug_server, SignalingContext, SignalingServer};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let matches = Command::new("selective-relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Selective-forwarding WebRTC media relay")
        .arg(
            Arg::new("ws-addr")
                .long("ws-addr")
                .takes_value(true)
                .help("WebSocket signaling listen address"),
        )
        .arg(
            Arg::new("debug-port")
                .long("debug-port")
                .takes_value(true)
                .help("Port for the debug HTTP endpoint"),
        )
        .get_matches();

    let mut config = ServerConfig::from_env();
    if let Some(addr) = matches.value_of("ws-addr") {
        config.ws_addr = addr.to_string();
    }
    if let Some(port) = matches.value_of("debug-port") {
        config.debug_port = port.parse()?;
    }

    info!("Starting node {} with {}", config.node_id, config.webrtc);

    let central = Arc::new(CentralNode::new(config.node_id.clone(), config.sfu.clone()));
    let _health = central.clone().spawn_health_monitor();

    let ctx = Arc::new(SignalingContext::new(central, config.webrtc.clone()));
    tokio::spawn(run_debug_server(ctx.clone(), config.debug_port));

    let server = SignalingServer::new(&config.ws_addr, ctx);
    server.run().await?;

    Ok(())
}
