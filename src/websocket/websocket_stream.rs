use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client_channel::{ClientChannel, MessageSource};

/// Largest accepted frame, and largest reassembled message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long queued frames may take to reach the socket once the channel is closed.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 16384;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Unknown(u8),
}

impl OpCode {
    pub fn from(code: u8) -> Self {
        match code {
            0 => OpCode::Continue,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            _ => OpCode::Unknown(code),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
            OpCode::Unknown(code) => *code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub final_frame: bool,
    pub opcode: OpCode,
    /// Already unmasked.
    pub payload: Bytes,
}

/// Takes one complete frame off the front of `buf`. Returns `None` and leaves `buf`
/// untouched when more bytes are needed.
pub fn parse_frame(buf: &mut BytesMut) -> io::Result<Option<Frame>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[0];
    let second = buf[1];
    let masked = second & 0x80 != 0;

    let (length, mut header_len) = match second & 0x7f {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let length = buf[2..10]
                .iter()
                .fold(0u64, |length, b| (length << 8) | (*b as u64));
            (length, 10)
        }
        length => (length as u64, 2),
    };

    if length > MAX_MESSAGE_SIZE as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length is too large ({length})"),
        ));
    }

    let mask = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let mask = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];
        header_len += 4;
        Some(mask)
    } else {
        None
    };

    let length = length as usize;
    if buf.len() < header_len + length {
        return Ok(None);
    }

    buf.advance(header_len);
    let mut payload = buf.split_to(length);
    if let Some(mask) = mask {
        for (byte, key) in payload.iter_mut().zip(mask.iter().cycle()) {
            *byte ^= key;
        }
    }

    Ok(Some(Frame {
        final_frame: first & 0x80 != 0,
        opcode: OpCode::from(first & 0x0f),
        payload: payload.freeze(),
    }))
}

/// Server frames go out unmasked. Clients must pass a mask.
pub fn encode_frame(
    opcode: OpCode,
    final_frame: bool,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 14);
    let fin_bit = if final_frame { 0x80 } else { 0 };
    frame.put_u8(fin_bit | opcode.code());

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if payload.len() < 126 {
        frame.put_u8(mask_bit | payload.len() as u8);
    } else if payload.len() <= 65535 {
        frame.put_u8(mask_bit | 0x7e);
        frame.put_u16(payload.len() as u16);
    } else {
        frame.put_u8(mask_bit | 0x7f);
        frame.put_u64(payload.len() as u64);
    }

    match mask {
        Some(mask) => {
            frame.put_slice(&mask);
            frame.extend(payload.iter().zip(mask.iter().cycle()).map(|(b, k)| b ^ k));
        }
        None => frame.put_slice(payload),
    }
    frame.freeze()
}

enum WriteCommand {
    Data(Bytes),
    Pong(Bytes),
    Close,
}

/// Server side of a websocket connection as a [`ClientChannel`].
///
/// Every `send` becomes one binary message. A writer task owns the socket; the
/// buffered amount covers payload bytes that task has not written yet.
pub struct WebsocketChannel {
    commands: mpsc::UnboundedSender<WriteCommand>,
    buffered: Arc<AtomicUsize>,
    closing: AtomicBool,
    token: CancellationToken,
}

impl WebsocketChannel {
    pub fn spawn<W>(writer: W) -> (Arc<Self>, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let handle = tokio::spawn(run_writer(
            writer,
            receiver,
            buffered.clone(),
            token.clone(),
        ));

        let channel = Arc::new(Self {
            commands,
            buffered,
            closing: AtomicBool::new(false),
            token,
        });
        (channel, handle)
    }

    fn send_pong(&self, payload: Bytes) {
        if self.is_open() {
            let _ = self.commands.send(WriteCommand::Pong(payload));
        }
    }
}

#[async_trait]
impl ClientChannel for WebsocketChannel {
    fn send(&self, data: Bytes) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "websocket is closed",
            ));
        }
        let len = data.len();
        self.buffered.fetch_add(len, Ordering::Relaxed);
        self.commands.send(WriteCommand::Data(data)).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::Relaxed);
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket writer is gone")
        })
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(WriteCommand::Close);
        self.token.cancel();
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    buffered: Arc<AtomicUsize>,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    let drain = async {
        while let Some(command) = commands.recv().await {
            let (frame, data_len, last) = match command {
                WriteCommand::Data(data) => {
                    (encode_frame(OpCode::Binary, true, &data, None), data.len(), false)
                }
                WriteCommand::Pong(payload) => {
                    (encode_frame(OpCode::Pong, true, &payload, None), 0, false)
                }
                // Status 1000, normal closure.
                WriteCommand::Close => (
                    encode_frame(OpCode::Close, true, &1000u16.to_be_bytes(), None),
                    0,
                    true,
                ),
            };
            if let Err(e) = writer.write_all(&frame).await {
                debug!("websocket write failed: {e}");
                break;
            }
            buffered.fetch_sub(data_len, Ordering::Relaxed);
            if last {
                break;
            }
        }
        let _ = writer.shutdown().await;
    };
    tokio::pin!(drain);

    tokio::select! {
        _ = &mut drain => {}
        _ = async {
            token.cancelled().await;
            tokio::time::sleep(CLOSE_DRAIN_TIMEOUT).await;
        } => {
            debug!("websocket peer stopped reading, dropping queued frames");
        }
    }
    token.cancel();
}

/// Client messages read off the websocket: early data first, then one item per
/// data message with fragments reassembled. Pings are answered and a close frame
/// is echoed.
pub struct WebsocketMessageSource<R> {
    reader: R,
    channel: Arc<WebsocketChannel>,
    buf: BytesMut,
    early_data: Option<Bytes>,
    partial_message: Option<BytesMut>,
}

impl<R> WebsocketMessageSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(
        reader: R,
        channel: Arc<WebsocketChannel>,
        unparsed_data: &[u8],
        early_data: Option<Bytes>,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE.max(unparsed_data.len()));
        buf.extend_from_slice(unparsed_data);
        Self {
            reader,
            channel,
            buf,
            early_data: early_data.filter(|data| !data.is_empty()),
            partial_message: None,
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> io::Result<Option<Option<Bytes>>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.partial_message.is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "new websocket message before the previous one finished",
                    ));
                }
                if frame.final_frame {
                    return Ok(Some(Some(frame.payload)));
                }
                self.partial_message = Some(BytesMut::from(&frame.payload[..]));
            }
            OpCode::Continue => {
                let Some(partial) = self.partial_message.as_mut() else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected websocket continuation frame",
                    ));
                };
                if partial.len() + frame.payload.len() > MAX_MESSAGE_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "websocket message is too large",
                    ));
                }
                partial.extend_from_slice(&frame.payload);
                if frame.final_frame {
                    return Ok(Some(self.partial_message.take().map(BytesMut::freeze)));
                }
            }
            OpCode::Ping => self.channel.send_pong(frame.payload),
            OpCode::Pong => {}
            OpCode::Close => {
                self.channel.close();
                return Ok(Some(None));
            }
            OpCode::Unknown(code) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported websocket opcode {code}"),
                ));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<R> MessageSource for WebsocketMessageSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_message(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(early_data) = self.early_data.take() {
            return Ok(Some(early_data));
        }
        loop {
            while let Some(frame) = parse_frame(&mut self.buf)? {
                if let Some(message) = self.handle_frame(frame)? {
                    return Ok(message);
                }
            }
            self.buf.reserve(READ_BUFFER_SIZE);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }
}
