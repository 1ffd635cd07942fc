//! HTTP message model, wire codec and proxy rewriting rules

pub mod codec;
pub mod message;
pub mod rewrite;

pub use codec::{CodecSide, HttpDecoder, HttpEncoder};
pub use message::{Headers, HttpObject, RequestHead, ResponseHead, Version};
