//! HTTP/1.1 support: incremental request decoding, response encoding,
//! and the per-connection serve loop.

mod encode;
mod parse;
mod server;

pub use server::serve;
