//! Privilege-separated helper.
//!
//! When the target cannot be written by the current user, the mutating phases run in a
//! second copy of this executable started with elevated rights. The two processes share
//! the serialized [`UpdateRequest`](crate::request::UpdateRequest) on disk and a one-way
//! line channel (the helper's stdout, or a named pipe where stdout is not reachable):
//!
//! - [`launcher`]: parent side, starts the helper and follows the channel
//! - [`child`]: helper side, runs the request and writes the channel
//! - [`channel`]: the writing half of the channel as an event sink
//! - [`protocol`]: line encoding shared by both sides

pub mod channel;
pub mod child;
pub mod launcher;
pub mod protocol;

pub use channel::ChannelWriter;
pub use child::run_helper;
pub use launcher::{HelperLauncher, Tail, consume_channel};
pub use protocol::{ChannelLine, HelperResponse, decode_line};
