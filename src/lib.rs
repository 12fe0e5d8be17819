//! Secmon Client - control and event bridge for an out-of-process security service.
//!
//! The service runs as a separate, privileged process. This crate keeps a
//! channel to it alive, exposes its control operations as blocking calls and
//! routes its callbacks (path interest, authorization, notifications, custom
//! messages) to user handlers.
//!
//! Start with [`client::Client`]. [`ipc::LoopbackService`] provides an
//! in-process service for tests and demos.

pub mod client;
pub mod codec;
pub mod config;
pub mod ipc;
pub mod model;
