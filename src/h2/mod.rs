//! HTTP/2 support: the connection serve loop over the `h2` codec, and
//! the open-stream accounting that gates connection close.

mod server;
pub(crate) mod tracker;

pub use server::serve;
