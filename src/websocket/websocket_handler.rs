use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use bytes::Bytes;
use log::debug;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::websocket_stream::{WebsocketChannel, WebsocketMessageSource};
use crate::address::OverrideTarget;
use crate::client_channel::ClientChannel;
use crate::line_reader::LineReader;
use crate::relay_session::run_session;
use crate::shared_state::SharedState;

const MAX_HEADER_LINE_LENGTH: usize = 4096;
const MAX_HEADER_LINES: usize = 40;
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const PADDING_INDIFFERENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_encode_padding(false)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);
const URL_SAFE_EARLY_DATA: GeneralPurpose =
    GeneralPurpose::new(&alphabet::URL_SAFE, PADDING_INDIFFERENT);
const STANDARD_EARLY_DATA: GeneralPurpose =
    GeneralPurpose::new(&alphabet::STANDARD, PADDING_INDIFFERENT);

/// Accepts websocket upgrades and runs one relay session per connection.
pub struct WebsocketServerHandler {
    /// Exact request path required, unless the path names an override destination.
    websocket_path: Option<String>,
    fallback: Option<OverrideTarget>,
    state: Arc<SharedState>,
}

impl WebsocketServerHandler {
    pub fn new(
        websocket_path: Option<String>,
        fallback: Option<OverrideTarget>,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            websocket_path,
            fallback,
            state,
        }
    }

    pub async fn handle_stream<S>(&self, mut stream: S, peer: SocketAddr) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ParsedHttpData {
            first_line,
            headers: mut request_headers,
            line_reader,
        } = match timeout(UPGRADE_TIMEOUT, ParsedHttpData::parse(&mut stream)).await {
            Ok(result) => result?,
            Err(elapsed) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("websocket upgrade timed out: {elapsed}"),
                ));
            }
        };

        let Some(request_path) = parse_request_path(&first_line) else {
            write_error_response(&mut stream, "400 Bad Request").await;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid http request: {first_line}"),
            ));
        };

        let is_upgrade = request_headers
            .get("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let websocket_key = request_headers.remove("sec-websocket-key");
        let Some(websocket_key) = websocket_key.filter(|_| is_upgrade) else {
            write_error_response(&mut stream, "400 Bad Request").await;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not a websocket upgrade request",
            ));
        };

        let path_override = path_override(request_path);
        if let Some(expected_path) = &self.websocket_path
            && path_without_query(request_path) != expected_path.as_str()
            && path_override.is_none()
        {
            write_error_response(&mut stream, "404 Not Found").await;
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unexpected websocket path: {request_path}"),
            ));
        }
        let override_target = path_override.or_else(|| self.fallback.clone());

        let protocol_header = request_headers.remove("sec-websocket-protocol");
        let early_data = match protocol_header.as_deref().map(decode_early_data) {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                write_error_response(&mut stream, "400 Bad Request").await;
                return Err(e);
            }
            None => None,
        };

        let protocol_response_header = match &protocol_header {
            Some(v) => format!("Sec-WebSocket-Protocol: {v}\r\n"),
            None => String::new(),
        };

        let http_response = format!(
            concat!(
                "HTTP/1.1 101 Switching Protocols\r\n",
                "Upgrade: websocket\r\n",
                "Connection: Upgrade\r\n",
                "Sec-WebSocket-Accept: {}\r\n",
                "{}",
                "\r\n"
            ),
            create_websocket_key_response(&websocket_key),
            protocol_response_header,
        );
        stream.write_all(http_response.as_bytes()).await?;

        debug!(
            "[{peer}] websocket upgraded, early data {} bytes, override {}",
            early_data.as_ref().map_or(0, Bytes::len),
            override_target
                .as_ref()
                .map_or_else(|| "none".to_string(), ToString::to_string)
        );

        let (reader, writer) = tokio::io::split(stream);
        let (channel, writer_task) = WebsocketChannel::spawn(writer);
        let mut source = WebsocketMessageSource::new(
            reader,
            channel.clone(),
            line_reader.unparsed_data(),
            early_data,
        );

        let result = run_session(
            &mut source,
            channel.clone(),
            self.state.clone(),
            override_target,
            peer,
        )
        .await;

        channel.close();
        if let Err(e) = writer_task.await {
            debug!("[{peer}] websocket writer task failed: {e}");
        }
        result
    }
}

struct ParsedHttpData {
    first_line: String,
    headers: HashMap<String, String>,
    line_reader: LineReader,
}

impl ParsedHttpData {
    async fn parse<T>(stream: &mut T) -> std::io::Result<Self>
    where
        T: AsyncRead + Unpin + ?Sized,
    {
        let mut line_reader = LineReader::new();
        let mut first_line: Option<String> = None;
        let mut headers: HashMap<String, String> = HashMap::new();

        let mut line_count = 0;
        loop {
            let line = line_reader.read_line(stream).await?;
            if line.is_empty() {
                break;
            }

            if line.len() >= MAX_HEADER_LINE_LENGTH {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "http request line is too long",
                ));
            }

            if first_line.is_none() {
                first_line = Some(line.to_string());
            } else {
                let Some((header_key, header_value)) = line.split_once(':') else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid http request line: {line}"),
                    ));
                };
                headers.insert(
                    header_key.trim().to_lowercase(),
                    header_value.trim().to_string(),
                );
            }

            line_count += 1;
            if line_count >= MAX_HEADER_LINES {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "http request is too long",
                ));
            }
        }

        let first_line = first_line.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "empty http request")
        })?;

        Ok(Self {
            first_line,
            headers,
            line_reader,
        })
    }
}

/// The path of a `GET <path> HTTP/1.x` request line.
fn parse_request_path(first_line: &str) -> Option<&str> {
    let rest = first_line.strip_prefix("GET ")?;
    rest.strip_suffix(" HTTP/1.1")
        .or_else(|| rest.strip_suffix(" HTTP/1.0"))
}

fn path_without_query(path: &str) -> &str {
    path.split_once('?').map_or(path, |(path, _)| path)
}

/// `/<host><sep><port>` names the destination for retries. Paths that do not end
/// in a port are ordinary paths.
fn path_override(path: &str) -> Option<OverrideTarget> {
    let target = path_without_query(path).trim_start_matches('/');
    if target.is_empty() {
        return None;
    }
    OverrideTarget::parse(target)
        .ok()
        .filter(|target| target.port().is_some())
}

fn decode_early_data(value: &str) -> std::io::Result<Option<Bytes>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let engine = if value.contains(['+', '/']) {
        &STANDARD_EARLY_DATA
    } else {
        &URL_SAFE_EARLY_DATA
    };
    let data = engine.decode(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid early data: {e}"),
        )
    })?;
    Ok(Some(Bytes::from(data)).filter(|data| !data.is_empty()))
}

fn create_websocket_key_response(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

async fn write_error_response<S>(stream: &mut S, status: &str)
where
    S: AsyncWrite + Unpin,
{
    let response =
        format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
