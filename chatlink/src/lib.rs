//! `chatlink`: client-side real-time chat session layer.
//!
//! Keeps a chat channel connected while credentials, network reachability
//! and per-conversation generation state change underneath it.

pub mod alert;
pub mod auth;
pub mod channel;
pub mod config;
pub mod generation;
pub mod reachability;
pub mod scope;
pub mod session;
pub mod transport;
