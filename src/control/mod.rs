//! Control and event channel plumbing.
//!
//! [`protocol`] defines the JSON envelope conventions, [`dispatch`] the
//! explicit command map, and [`server`] the request/response TCP transport.
//! The broadcast side (events, frame sidebands) reuses
//! [`crate::bus::SidebandPublisher`].

pub mod dispatch;
pub mod protocol;
pub mod server;

pub use dispatch::{CommandDispatcher, Handler};
pub use protocol::{error_reply, event, ok_reply};
pub use server::{ChannelPorts, ControlServer};
