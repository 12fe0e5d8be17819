//! IPC bridge between the client and the privileged security service.
//!
//! The service is a separate process that may die and come back at any time.
//! This module provides the pieces that make that channel usable:
//!
//! - [`ConnectionManager`]: creates the channel through a caller-supplied
//!   [`ChannelFactory`], opens a session, reconnects after interruptions.
//! - [`SyncBridge`]: turns callback-based remote calls into blocking calls
//!   with a timeout, one at a time.
//! - [`Dispatcher`]: receives the service's callbacks and runs user handlers
//!   on an [`Executor`].
//! - [`LoopbackService`]: an in-process service for tests and demos.
//!
//! # Architecture
//!
//! ```text
//! Client                               Service
//!   |                                     |
//!   |-- CreateSession(converter) -------->|  (every (re)connect)
//!   |<-- Done ----------------------------|
//!   |-- Subscribe / Mute / ... ---------->|  (SyncBridge, blocking)
//!   |<-- Done | Flag | error -------------|
//!   |                                     |
//!   |<-- path interest / auth / notify ---|  (Dispatcher)
//!   |--- verdict / resolution ----------->|
//! ```

pub mod bridge;
pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod executor;
pub mod loopback;
pub mod types;

pub use bridge::{Completion, PendingCall, SyncBridge};
pub use channel::{Channel, ChannelContext, ChannelFactory, ReplyFn, ServiceDelegate};
pub use connection::{ChannelEvents, ConnectionManager, ConnectionState, StateHandler};
pub use dispatcher::{
    AuthHandler, CustomMessageHandler, CustomReply, Dispatcher, HandlerSet, NotifyHandler,
    PathInterestHandler, ResolutionReply,
};
pub use executor::{Executor, Job, PoolExecutor, SerialQueue};
pub use loopback::{AuthOutcome, LoopbackService};
pub use types::{ClientError, RemoteResult, ServiceReply, ServiceRequest};
