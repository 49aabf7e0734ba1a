pub mod markers;
pub mod stream_decoder;
