//! TCP relay for one client stream: connect (pool first, then a fresh socket under the
//! adaptive timeout), pump replies back, and retry with backoff when the first
//! attempt fails or yields nothing.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::address::{NetLocation, OverrideTarget};
use crate::async_stream::AsyncStream;
use crate::client_channel::ClientChannel;
use crate::connection_pool::OutboundSocket;
use crate::retry::{RETRY_MAX_ATTEMPTS, calculate_backoff};
use crate::shared_state::SharedState;
use crate::stats::{add, incr};
use crate::stream_pump::{PumpEnd, ResponsePrefix, StreamPump};

/// A connect past this fraction of its timeout is reported as a slow success.
const SLOW_CONNECT_RATIO: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct TcpRequest {
    pub destination: NetLocation,
    /// Client bytes that followed the protocol header in the first frame.
    pub payload: Bytes,
    pub response_prefix: Option<Bytes>,
    /// Used for retries only, never for the first attempt.
    pub override_target: Option<OverrideTarget>,
}

enum RelayResult {
    Done,
    NoData,
}

/// Runs the relay until it reaches a terminal state. Failures are logged and end with
/// the client channel closed; nothing is returned to the caller.
///
/// `client_frames` carries every client frame received after the first one. Frames
/// that arrive while connecting wait in the queue.
pub async fn handle_tcp_outbound(
    request: TcpRequest,
    channel: Arc<dyn ClientChannel>,
    mut client_frames: mpsc::Receiver<Bytes>,
    state: Arc<SharedState>,
) {
    let prefix = ResponsePrefix::new(request.response_prefix.clone());
    let destination = &request.destination;

    let needs_retry = match connect_and_write(&state, destination, &request.payload, true).await
    {
        Ok(stream) => {
            let result = relay(
                stream,
                destination,
                channel.as_ref(),
                &mut client_frames,
                &prefix,
                &state,
            )
            .await;
            matches!(result, RelayResult::NoData)
        }
        Err(e) => {
            debug!("{destination}: TCP connection failed: {e}");
            true
        }
    };

    if needs_retry {
        debug!("{destination}: retry");
        retry_with_backoff(&request, channel.as_ref(), &mut client_frames, &prefix, &state).await;
    }

    state.latency.cleanup();
}

async fn connect_and_write(
    state: &SharedState,
    location: &NetLocation,
    payload: &[u8],
    use_pool: bool,
) -> std::io::Result<Box<dyn AsyncStream>> {
    if use_pool && let Some(socket) = state.pool.get(location) {
        let mut stream = socket.into_inner();
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        return Ok(stream);
    }

    let key = location.to_string();
    let timeout = state.latency.calculate_timeout(&key);
    let connect_start = Instant::now();

    let mut stream = match tokio::time::timeout(timeout, state.connector.connect(location)).await
    {
        Ok(result) => result?,
        Err(_) => {
            incr(&state.stats.timeout.fast_fail);
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connection timeout ({}ms)", timeout.as_millis()),
            ));
        }
    };

    let connect_time = connect_start.elapsed();
    let connect_ms = connect_time.as_millis() as u64;
    state.latency.record_latency(&key, connect_ms);

    if connect_time.as_secs_f64() > timeout.as_secs_f64() * SLOW_CONNECT_RATIO {
        incr(&state.stats.timeout.slow_success);
        warn!("slow but successful connect: {location} ({connect_ms}ms)");
    }
    debug!("connected to {location} in {connect_ms}ms");

    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    Ok(stream)
}

async fn relay(
    stream: Box<dyn AsyncStream>,
    location: &NetLocation,
    channel: &dyn ClientChannel,
    client_frames: &mut mpsc::Receiver<Bytes>,
    prefix: &ResponsePrefix,
    state: &SharedState,
) -> RelayResult {
    let label = location.to_string();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut pump = StreamPump::new(channel, prefix, &state.stats, &label);
    let mut write_in_progress = false;

    let end = {
        let pump_future = pump.run(&mut reader);
        tokio::pin!(pump_future);

        tokio::select! {
            end = &mut pump_future => end,
            forwarded = forward_client_frames(client_frames, &mut writer, &mut write_in_progress) => {
                match forwarded {
                    // No more client frames will come; the pump ends once the
                    // channel closes.
                    Ok(()) => pump_future.await,
                    Err(e) => PumpEnd::Failed(e),
                }
            }
        }
    };

    match end {
        PumpEnd::ClientClosed {
            had_incoming_data: true,
        } if !write_in_progress => {
            let stream = reader.unsplit(writer);
            state.pool.put(location, OutboundSocket::new(stream));
            RelayResult::Done
        }
        PumpEnd::ClientClosed { .. } => RelayResult::Done,
        PumpEnd::RemoteClosed => {
            channel.close();
            RelayResult::Done
        }
        PumpEnd::NoData => RelayResult::NoData,
        PumpEnd::Failed(e) => {
            debug!("{label}: relay failed: {e}");
            channel.close();
            RelayResult::Done
        }
    }
}

async fn forward_client_frames<W>(
    client_frames: &mut mpsc::Receiver<Bytes>,
    writer: &mut W,
    write_in_progress: &mut bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = client_frames.recv().await {
        *write_in_progress = true;
        writer.write_all(&frame).await?;
        *write_in_progress = false;
    }
    Ok(())
}

async fn retry_with_backoff(
    request: &TcpRequest,
    channel: &dyn ClientChannel,
    client_frames: &mut mpsc::Receiver<Bytes>,
    prefix: &ResponsePrefix,
    state: &SharedState,
) {
    let retry_stats = &state.stats.retry;
    let target = match &request.override_target {
        Some(override_target) => override_target.resolve(&request.destination),
        None => request.destination.clone(),
    };

    for attempt in 0..RETRY_MAX_ATTEMPTS {
        let delay = calculate_backoff(attempt);
        incr(&retry_stats.attempts);
        add(&retry_stats.total_delay_ms, delay.as_millis() as u64);
        debug!(
            "{}: retry attempt {}/{RETRY_MAX_ATTEMPTS} after {}ms backoff",
            request.destination,
            attempt + 1,
            delay.as_millis()
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = channel.closed() => {
                debug!("{}: client closed during retry backoff", request.destination);
                return;
            }
        }

        match connect_and_write(state, &target, &request.payload, false).await {
            Ok(stream) => {
                incr(&retry_stats.successes);
                debug!(
                    "{}: retry succeeded on attempt {} via {target}",
                    request.destination,
                    attempt + 1
                );
                relay(stream, &target, channel, client_frames, prefix, state).await;
                channel.close();
                return;
            }
            Err(e) => {
                debug!(
                    "{}: retry attempt {} failed: {e}",
                    request.destination,
                    attempt + 1
                );
            }
        }
    }

    incr(&retry_stats.failures);
    warn!(
        "{}: max retry attempts ({RETRY_MAX_ATTEMPTS}) exceeded",
        request.destination
    );
    channel.close();
}
