mod websocket_handler;
mod websocket_stream;

pub use websocket_handler::WebsocketServerHandler;
pub use websocket_stream::{
    Frame, MAX_MESSAGE_SIZE, OpCode, WebsocketChannel, WebsocketMessageSource, encode_frame,
    parse_frame,
};
