//! Channel abstraction.
//!
//! The transport to the privileged service is supplied by the caller through a
//! [`ChannelFactory`]. The factory is invoked once per connection attempt with
//! a [`ChannelContext`]: the delegate that inbound calls must be routed to, and
//! the [`ChannelEvents`] handle the channel uses to report that it died.
//!
//! ```text
//! Client                           Service
//!   |-- Channel::call ------------->|
//!   |<-- reply callback ------------|
//!   |                               |
//!   |<-- ServiceDelegate::handle_* -|
//!   |--- reply callback ----------->|
//! ```

use std::sync::Arc;

use super::{ChannelEvents, ClientError, RemoteResult, ServiceRequest};

/// One-shot reply callback.
pub type ReplyFn<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Client-side view of a live channel.
///
/// All methods are callback based; a reply callback may never be invoked if
/// the service goes away, and dropping it unused signals exactly that.
pub trait Channel: Send + Sync {
    /// Issues a control request.
    fn call(&self, request: ServiceRequest, reply: ReplyFn<RemoteResult>);

    /// Forwards an opaque payload to the service's custom-message handler.
    fn send_custom_message(&self, data: Vec<u8>, reply: ReplyFn<Result<Vec<u8>, String>>);

    /// Tears the channel down. No events are reported for a client-initiated
    /// invalidation.
    fn invalidate(&self);
}

/// Inbound surface the service calls into.
pub trait ServiceDelegate: Send + Sync {
    /// Returns an encoded interest verdict, or `None` for "no opinion".
    fn handle_path_interest(&self, payload: &[u8]) -> Option<Vec<u8>>;

    /// Replies exactly once with a decision code and cache flag.
    fn handle_auth(&self, payload: &[u8], reply: ReplyFn<(u32, bool)>);

    /// Fire-and-forget notification.
    fn handle_notify(&self, payload: &[u8]);

    /// Opaque request/response exchange.
    fn handle_custom_message(&self, payload: &[u8], reply: ReplyFn<Result<Vec<u8>, String>>);
}

/// Everything a factory needs to build a channel.
#[derive(Clone)]
pub struct ChannelContext {
    pub delegate: Arc<dyn ServiceDelegate>,
    pub events: ChannelEvents,
}

/// Creates a new channel for each connection attempt.
pub type ChannelFactory =
    Arc<dyn Fn(ChannelContext) -> Result<Arc<dyn Channel>, ClientError> + Send + Sync>;
