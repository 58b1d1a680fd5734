//! Shared wire definitions for the `chatlink` channel protocol.

pub mod event;
pub mod frame;
pub mod message;
