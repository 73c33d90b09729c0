mod listen;
mod write;

pub use listen::{
    decode_listen_request, encode_unwatch_request, encode_watch_request, ListenRequest, WatchStream,
    LISTEN_TAGS_LABEL,
};
pub use write::{
    decode_write_request, decode_write_response, encode_handshake, encode_write_request,
    encode_write_response, WriteRequest, WriteResponse, WriteStream,
};
