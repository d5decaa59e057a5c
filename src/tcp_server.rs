use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::{ServerConfig, TcpConfig};
use crate::outbound::TcpSocketConnector;
use crate::resolver::{NativeResolver, Resolver};
use crate::shared_state::SharedState;
use crate::socket_util::{new_tcp_listener, set_tcp_keepalive};
use crate::stats::Stats;
use crate::websocket::WebsocketServerHandler;

const LISTEN_BACKLOG: i32 = 4096;

async fn run_tcp_server(
    listener: TcpListener,
    tcp_config: TcpConfig,
    server_handler: Arc<WebsocketServerHandler>,
) {
    let TcpConfig { no_delay } = tcp_config;

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("Accept failed: {e}");
                continue;
            }
        };

        if let Err(e) = set_tcp_keepalive(
            &stream,
            Duration::from_secs(300),
            Duration::from_secs(60),
        ) {
            error!("Failed to set TCP keepalive: {e}");
        }

        if no_delay && let Err(e) = stream.set_nodelay(true) {
            error!("Failed to set TCP nodelay: {e}");
        }

        let cloned_handler = server_handler.clone();
        tokio::spawn(async move {
            if let Err(e) = cloned_handler.handle_stream(stream, addr).await {
                debug!("{}:{} finished with error: {e}", addr.ip(), addr.port());
            } else {
                debug!("{}:{} finished successfully", addr.ip(), addr.port());
            }
        });
    }
}

async fn log_stats(bind_address: SocketAddr, stats: Arc<Stats>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        info!("{bind_address} stats: {}", stats.summary());
    }
}

/// Binds the listener and spawns its accept loop, plus the stats logger when
/// enabled.
pub async fn start_server(config: ServerConfig) -> std::io::Result<Vec<JoinHandle<()>>> {
    let ServerConfig {
        bind_address,
        fallback,
        relay,
        websocket_path,
        tcp_settings,
        stats_interval,
    } = config;

    let resolver: Arc<dyn Resolver> = Arc::new(NativeResolver::new());
    let connector = Arc::new(TcpSocketConnector::new(resolver, tcp_settings.no_delay));
    let state = Arc::new(SharedState::new(connector, relay));
    let stats = state.stats.clone();
    let server_handler = Arc::new(WebsocketServerHandler::new(websocket_path, fallback, state));

    let listener = new_tcp_listener(bind_address, LISTEN_BACKLOG)?;
    info!("Starting websocket server at {bind_address}");

    let mut handles = vec![tokio::spawn(run_tcp_server(
        listener,
        tcp_settings,
        server_handler,
    ))];

    if let Some(period) = stats_interval {
        handles.push(tokio::spawn(log_stats(bind_address, stats, period)));
    }

    Ok(handles)
}

pub async fn start_servers(configs: Vec<ServerConfig>) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut join_handles = Vec::with_capacity(configs.len());
    for config in configs {
        join_handles.extend(start_server(config).await?);
    }
    Ok(join_handles)
}
