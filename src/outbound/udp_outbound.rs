use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;

use crate::address::NetLocation;
use crate::client_channel::ClientChannel;
use crate::shared_state::SharedState;
use crate::stats::incr;
use crate::stream_pump::{BACKPRESSURE_POLL_INTERVAL, BUFFER_HIGH_WATERMARK, ResponsePrefix};

pub const UDP_RELAY_TIMEOUT: Duration = Duration::from_secs(15);

const UDP_READ_BUFFER_SIZE: usize = 16 * 1024;

/// `udp:<address>:<port>|` followed by the datagram.
pub fn relay_envelope(target: &NetLocation, payload: &[u8]) -> Bytes {
    let header = format!("udp:{}:{}|", target.address(), target.port());
    let mut envelope = BytesMut::with_capacity(header.len() + payload.len());
    envelope.put_slice(header.as_bytes());
    envelope.put_slice(payload);
    envelope.freeze()
}

/// Tunnels one datagram through the UDP relay and streams the relay's replies back
/// to the client until the relay closes or the client goes away.
pub async fn handle_udp_outbound(
    target: NetLocation,
    payload: Bytes,
    channel: Arc<dyn ClientChannel>,
    prefix: Arc<ResponsePrefix>,
    state: Arc<SharedState>,
) {
    let relay = &state.relay.udp_relay;
    let connect = async {
        let mut stream = state.connector.connect(relay).await?;
        stream.write_all(&relay_envelope(&target, &payload)).await?;
        Ok::<_, std::io::Error>(stream)
    };

    let mut stream = match tokio::time::timeout(UDP_RELAY_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("UDP relay {relay} for {target} failed: {e}");
            channel.close();
            return;
        }
        Err(_) => {
            warn!(
                "UDP relay {relay} for {target} timed out after {}s",
                UDP_RELAY_TIMEOUT.as_secs()
            );
            channel.close();
            return;
        }
    };

    let mut buf = BytesMut::with_capacity(UDP_READ_BUFFER_SIZE);
    loop {
        buf.reserve(UDP_READ_BUFFER_SIZE);
        let n = tokio::select! {
            result = stream.read_buf(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    debug!("UDP relay read for {target} failed: {e}");
                    channel.close();
                    return;
                }
            },
            _ = channel.closed() => return,
        };
        if n == 0 {
            debug!("UDP relay for {target} closed normally");
            return;
        }

        if channel.buffered_amount() > BUFFER_HIGH_WATERMARK {
            incr(&state.stats.buffer.backpressure_events);
            while channel.buffered_amount() > BUFFER_HIGH_WATERMARK {
                if !channel.is_open() {
                    return;
                }
                sleep(BACKPRESSURE_POLL_INTERVAL).await;
            }
        }

        if let Err(e) = channel.send(prefix.apply(buf.split().freeze())) {
            debug!("UDP reply for {target} dropped: {e}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_channel::testing::RecordingChannel;
    use crate::outbound::testing::MockConnector;
    use crate::shared_state::RelayConfig;
    use std::sync::atomic::Ordering;

    fn state(connector: Arc<MockConnector>) -> Arc<SharedState> {
        Arc::new(SharedState::new(
            connector,
            RelayConfig {
                udp_relay: NetLocation::from_str("relay.test:7300", None).unwrap(),
                dns_server: NetLocation::from_str("8.8.8.8:53", None).unwrap(),
            },
        ))
    }

    #[test]
    fn test_relay_envelope_format() {
        let target = NetLocation::from_str("8.8.8.8:53", None).unwrap();
        assert_eq!(
            &relay_envelope(&target, b"\x12\x34")[..],
            b"udp:8.8.8.8:53|\x12\x34"
        );

        let target = NetLocation::from_str("dns.local:5353", None).unwrap();
        assert_eq!(&relay_envelope(&target, b"")[..], b"udp:dns.local:5353|");
    }

    #[tokio::test]
    async fn test_reply_relayed_with_prefix() {
        let connector = Arc::new(MockConnector::default());
        let (local, mut remote) = tokio::io::duplex(1024);
        connector.push_stream(local);
        let state = state(connector.clone());
        let channel = Arc::new(RecordingChannel::new());
        let prefix = Arc::new(ResponsePrefix::new(Some(Bytes::from_static(&[0, 0]))));

        let target = NetLocation::from_str("8.8.8.8:53", None).unwrap();
        let task = tokio::spawn(handle_udp_outbound(
            target,
            Bytes::from_static(b"query"),
            channel.clone(),
            prefix.clone(),
            state,
        ));

        let mut buf = vec![0u8; "udp:8.8.8.8:53|query".len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"udp:8.8.8.8:53|query");

        remote.write_all(b"answer").await.unwrap();
        remote.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(connector.attempts.lock()[0].to_string(), "relay.test:7300");
        assert_eq!(channel.sent_bytes(), b"\x00\x00answer");
        assert!(!prefix.is_pending());
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_relay_failure_closes_channel() {
        let connector = Arc::new(MockConnector::refusing());
        let channel = Arc::new(RecordingChannel::new());

        handle_udp_outbound(
            NetLocation::from_str("1.1.1.1:53", None).unwrap(),
            Bytes::from_static(b"q"),
            channel.clone(),
            Arc::new(ResponsePrefix::default()),
            state(connector),
        )
        .await;

        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_reply_waits_for_buffered_drain() {
        let connector = Arc::new(MockConnector::default());
        let (local, mut remote) = tokio::io::duplex(1024);
        connector.push_stream(local);
        let state = state(connector);
        let channel = Arc::new(RecordingChannel::new());
        channel.set_buffered(BUFFER_HIGH_WATERMARK + 1);

        let task = tokio::spawn(handle_udp_outbound(
            NetLocation::from_str("9.9.9.9:53", None).unwrap(),
            Bytes::from_static(b"q"),
            channel.clone(),
            Arc::new(ResponsePrefix::default()),
            state.clone(),
        ));

        let mut buf = vec![0u8; "udp:9.9.9.9:53|q".len()];
        remote.read_exact(&mut buf).await.unwrap();
        remote.write_all(b"answer").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.sent_count(), 0);
        assert_eq!(
            state.stats.buffer.backpressure_events.load(Ordering::Relaxed),
            1
        );

        channel.set_buffered(0);
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL * 2).await;
        assert_eq!(channel.sent_bytes(), b"answer");

        remote.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(!channel.is_closed());
    }
}
