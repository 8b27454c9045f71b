//! Channel management for hearth.
//!
//! A channel is a named group conversation with durable membership and an
//! append-only message log. This crate keeps the in-memory side of that:
//!
//! - [`ChannelDirectory`]: create, join, leave, list; the durable membership
//!   check; the online-member sets used for fan-out; and one sequencer per
//!   channel that keeps delivery order equal to message id order.
//! - [`ChannelError`]: what went wrong, with the wire code to report.

mod directory;
mod error;
mod name;

pub use directory::ChannelDirectory;
pub use error::ChannelError;
pub use name::{MAX_NAME_LEN, is_valid_name};
