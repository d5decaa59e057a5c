//! One client stream from its first message to teardown.
//!
//! The first message is sniffed and decapsulated. TCP streams get one outbound task
//! that receives every later message through a queue, written verbatim in arrival
//! order. UDP streams relay each later message as its own datagram to the target
//! chosen by the first one.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::address::{NetLocation, OverrideTarget};
use crate::client_channel::{ClientChannel, MessageSource};
use crate::outbound::{TcpRequest, handle_tcp_outbound, handle_udp_outbound};
use crate::protocol::decapsulate;
use crate::shared_state::SharedState;
use crate::stream_pump::ResponsePrefix;

/// Client messages that may wait for the TCP outbound task while it connects.
const CLIENT_QUEUE_SIZE: usize = 32;

const DNS_PORT: u16 = 53;

enum SessionState {
    AwaitingHeader,
    Tcp {
        sender: mpsc::Sender<Bytes>,
        handle: JoinHandle<()>,
    },
    Udp {
        target: NetLocation,
        prefix: Arc<ResponsePrefix>,
    },
}

pub async fn run_session<M>(
    source: &mut M,
    channel: Arc<dyn ClientChannel>,
    state: Arc<SharedState>,
    override_target: Option<OverrideTarget>,
    peer: SocketAddr,
) -> std::io::Result<()>
where
    M: MessageSource + ?Sized,
{
    state.stats.stream_started();
    let mut udp_tasks = JoinSet::new();
    let result = drive_session(
        source,
        &channel,
        &state,
        override_target,
        peer,
        &mut udp_tasks,
    )
    .await;
    udp_tasks.shutdown().await;
    state.stats.stream_finished();
    result
}

async fn drive_session<M>(
    source: &mut M,
    channel: &Arc<dyn ClientChannel>,
    state: &Arc<SharedState>,
    override_target: Option<OverrideTarget>,
    peer: SocketAddr,
    udp_tasks: &mut JoinSet<()>,
) -> std::io::Result<()>
where
    M: MessageSource + ?Sized,
{
    let mut session = SessionState::AwaitingHeader;
    let mut override_target = override_target;

    loop {
        let message = tokio::select! {
            message = source.next_message() => message,
            _ = channel.closed() => break,
        };
        let frame = match message {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("[{peer}] client read failed: {e}");
                break;
            }
        };

        session = match session {
            SessionState::AwaitingHeader => {
                if frame.is_empty() {
                    SessionState::AwaitingHeader
                } else {
                    match open_stream(frame, channel, state, override_target.take(), peer, udp_tasks)
                    {
                        Ok(session) => session,
                        Err(e) => {
                            channel.close();
                            return Err(e);
                        }
                    }
                }
            }
            SessionState::Tcp { sender, handle } => {
                if sender.send(frame).await.is_err() {
                    // The outbound task is gone and has already closed the channel.
                    if let Err(e) = handle.await {
                        warn!("[{peer}] outbound task failed: {e}");
                    }
                    return Ok(());
                }
                SessionState::Tcp { sender, handle }
            }
            SessionState::Udp { target, prefix } => {
                // Drop datagrams whose relay already finished.
                while udp_tasks.try_join_next().is_some() {}
                udp_tasks.spawn(handle_udp_outbound(
                    target.clone(),
                    frame,
                    channel.clone(),
                    prefix.clone(),
                    state.clone(),
                ));
                SessionState::Udp { target, prefix }
            }
        };
    }

    match session {
        SessionState::Tcp { sender, handle } => {
            drop(sender);
            channel.close();
            if let Err(e) = handle.await {
                warn!("[{peer}] outbound task failed: {e}");
            }
        }
        SessionState::AwaitingHeader | SessionState::Udp { .. } => channel.close(),
    }
    Ok(())
}

fn open_stream(
    frame: Bytes,
    channel: &Arc<dyn ClientChannel>,
    state: &Arc<SharedState>,
    override_target: Option<OverrideTarget>,
    peer: SocketAddr,
    udp_tasks: &mut JoinSet<()>,
) -> std::io::Result<SessionState> {
    let header = decapsulate(&frame).map_err(|e| {
        warn!("[{peer}] rejected first message: {e}");
        std::io::Error::from(e)
    })?;

    let location = header.location();
    debug!(
        "[{peer}] {} {} stream to {location}",
        header.protocol,
        if header.is_udp { "udp" } else { "tcp" }
    );

    if header.is_udp {
        let target = if header.port == DNS_PORT {
            state.relay.dns_server.clone()
        } else {
            location
        };
        let prefix = Arc::new(ResponsePrefix::new(header.response_prefix));
        udp_tasks.spawn(handle_udp_outbound(
            target.clone(),
            header.payload,
            channel.clone(),
            prefix.clone(),
            state.clone(),
        ));
        return Ok(SessionState::Udp { target, prefix });
    }

    let (sender, receiver) = mpsc::channel(CLIENT_QUEUE_SIZE);
    let request = TcpRequest {
        destination: location,
        payload: header.payload,
        response_prefix: header.response_prefix,
        override_target,
    };
    let handle = tokio::spawn(handle_tcp_outbound(
        request,
        channel.clone(),
        receiver,
        state.clone(),
    ));
    Ok(SessionState::Tcp { sender, handle })
}
