//! The streaming relay protocol: the gateway encodes, the client decodes.

pub mod decoder;
pub mod encoder;

pub use decoder::{FrameDecoder, decode_stream};
pub use encoder::{FrameStream, RelayOptions, encode_frame, relay, relay_opening};
