//! Inbound message dispatch.
//!
//! [`Dispatcher`] is the [`ServiceDelegate`] the client hands to every channel.
//! It decodes inbound payloads and runs the matching user handler on the
//! configured [`Executor`]. Handlers are invoked at most once per message.
//!
//! Authorization requests always get an answer: with no handler installed, on
//! a malformed payload, or when a handler drops its [`ResolutionReply`]
//! unused, the service receives [`Resolution::ALLOW_ONCE`].

use std::sync::mpsc;
use std::sync::{Arc, PoisonError, RwLock};

use super::{Executor, ReplyFn, ServiceDelegate};
use crate::codec::Codec;
use crate::model::{EventMessage, InterestVerdict, ProcessDescriptor, Resolution};

/// Decides whether a process's events are wanted at all.
///
/// Runs synchronously while the service waits: keep it cheap.
pub trait PathInterestHandler: Send + Sync {
    fn path_interest(&self, process: &ProcessDescriptor) -> Option<InterestVerdict>;
}

impl<F> PathInterestHandler for F
where
    F: Fn(&ProcessDescriptor) -> Option<InterestVerdict> + Send + Sync,
{
    fn path_interest(&self, process: &ProcessDescriptor) -> Option<InterestVerdict> {
        self(process)
    }
}

/// Answers authorization requests.
pub trait AuthHandler: Send + Sync {
    fn authorize(&self, message: EventMessage, reply: ResolutionReply);
}

impl<F> AuthHandler for F
where
    F: Fn(EventMessage, ResolutionReply) + Send + Sync,
{
    fn authorize(&self, message: EventMessage, reply: ResolutionReply) {
        self(message, reply);
    }
}

/// Receives notifications.
pub trait NotifyHandler: Send + Sync {
    fn notify(&self, message: EventMessage);
}

impl<F> NotifyHandler for F
where
    F: Fn(EventMessage) + Send + Sync,
{
    fn notify(&self, message: EventMessage) {
        self(message);
    }
}

/// Answers opaque custom messages from the service.
pub trait CustomMessageHandler: Send + Sync {
    fn custom_message(&self, data: Vec<u8>, reply: CustomReply);
}

impl<F> CustomMessageHandler for F
where
    F: Fn(Vec<u8>, CustomReply) + Send + Sync,
{
    fn custom_message(&self, data: Vec<u8>, reply: CustomReply) {
        self(data, reply);
    }
}

/// One-shot reply to an authorization request.
///
/// Dropping it without calling [`resolve`](Self::resolve) allows the event
/// once, so the service is never left waiting.
pub struct ResolutionReply {
    seq_num: u64,
    reply: Option<ReplyFn<(u32, bool)>>,
}

impl ResolutionReply {
    fn new(seq_num: u64, reply: ReplyFn<(u32, bool)>) -> Self {
        Self {
            seq_num,
            reply: Some(reply),
        }
    }

    pub fn resolve(mut self, resolution: Resolution) {
        if let Some(reply) = self.reply.take() {
            reply(resolution.to_wire());
        }
    }
}

impl Drop for ResolutionReply {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            tracing::warn!(
                seq_num = self.seq_num,
                "Auth reply dropped without a resolution, allowing once"
            );
            reply(Resolution::ALLOW_ONCE.to_wire());
        }
    }
}

impl std::fmt::Debug for ResolutionReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionReply")
            .field("seq_num", &self.seq_num)
            .field("pending", &self.reply.is_some())
            .finish()
    }
}

/// One-shot reply to a custom message.
///
/// Dropping it unused replies with an error.
pub struct CustomReply {
    reply: Option<ReplyFn<Result<Vec<u8>, String>>>,
}

impl CustomReply {
    pub fn send(mut self, result: Result<Vec<u8>, String>) {
        if let Some(reply) = self.reply.take() {
            reply(result);
        }
    }
}

impl Drop for CustomReply {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            reply(Err("custom message dropped without a reply".to_string()));
        }
    }
}

impl std::fmt::Debug for CustomReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomReply")
            .field("pending", &self.reply.is_some())
            .finish()
    }
}

/// Installed handlers, one optional handler per message category.
#[derive(Clone, Default)]
pub struct HandlerSet {
    pub path_interest: Option<Arc<dyn PathInterestHandler>>,
    pub auth: Option<Arc<dyn AuthHandler>>,
    pub notify: Option<Arc<dyn NotifyHandler>>,
    pub custom_message: Option<Arc<dyn CustomMessageHandler>>,
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("path_interest", &self.path_interest.is_some())
            .field("auth", &self.auth.is_some())
            .field("notify", &self.notify.is_some())
            .field("custom_message", &self.custom_message.is_some())
            .finish()
    }
}

/// Routes inbound service calls to user handlers.
pub struct Dispatcher {
    codec: Codec,
    handlers: RwLock<HandlerSet>,
    executor: RwLock<Arc<dyn Executor>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(codec: Codec, executor: Arc<dyn Executor>) -> Self {
        Self {
            codec,
            handlers: RwLock::new(HandlerSet::default()),
            executor: RwLock::new(executor),
        }
    }

    /// Replaces the execution context for messages dispatched from now on.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.executor.write().unwrap_or_else(PoisonError::into_inner) = executor;
    }

    /// Mutates the installed handlers.
    pub fn update_handlers(&self, update: impl FnOnce(&mut HandlerSet)) {
        update(&mut self.handlers.write().unwrap_or_else(PoisonError::into_inner));
    }

    /// Snapshot of the installed handlers.
    #[must_use]
    pub fn handlers(&self) -> HandlerSet {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ServiceDelegate for Dispatcher {
    fn handle_path_interest(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let process: ProcessDescriptor = match self.codec.decode(payload) {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(error = %e, "Dropping malformed path interest query");
                return None;
            }
        };
        let handler = self.handlers().path_interest?;

        let (tx, rx) = mpsc::sync_channel(1);
        self.executor().execute(Box::new(move || {
            let _ = tx.send(handler.path_interest(&process));
        }));
        let verdict = rx.recv().ok().flatten()?;

        match self.codec.encode(&verdict) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode interest verdict");
                None
            }
        }
    }

    fn handle_auth(&self, payload: &[u8], reply: ReplyFn<(u32, bool)>) {
        let message: EventMessage = match self.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "Malformed auth message, allowing once");
                reply(Resolution::ALLOW_ONCE.to_wire());
                return;
            }
        };

        let Some(handler) = self.handlers().auth else {
            tracing::warn!(
                seq_num = message.seq_num,
                event_type = %message.event_type,
                "No auth handler installed, allowing once"
            );
            reply(Resolution::ALLOW_ONCE.to_wire());
            return;
        };

        let reply = ResolutionReply::new(message.seq_num, reply);
        self.executor()
            .execute(Box::new(move || handler.authorize(message, reply)));
    }

    fn handle_notify(&self, payload: &[u8]) {
        let message: EventMessage = match self.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "Dropping malformed notification");
                return;
            }
        };
        let Some(handler) = self.handlers().notify else {
            tracing::trace!(seq_num = message.seq_num, "No notify handler installed");
            return;
        };

        self.executor()
            .execute(Box::new(move || handler.notify(message)));
    }

    fn handle_custom_message(&self, payload: &[u8], reply: ReplyFn<Result<Vec<u8>, String>>) {
        let Some(handler) = self.handlers().custom_message else {
            reply(Err(super::ClientError::HandlerNotSet.to_string()));
            return;
        };

        let data = payload.to_vec();
        let reply = CustomReply { reply: Some(reply) };
        self.executor()
            .execute(Box::new(move || handler.custom_message(data, reply)));
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers())
            .finish_non_exhaustive()
    }
}
