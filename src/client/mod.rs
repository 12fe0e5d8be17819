//! Client facade.
//!
//! [`Client`] is the public control surface. It owns the connection, the
//! blocking-call bridge and the inbound dispatcher, and exposes the service's
//! control operations as blocking methods.
//!
//! # Example
//!
//! ```no_run
//! use secmon_client::client::Client;
//! use secmon_client::ipc::LoopbackService;
//! use secmon_client::codec::Codec;
//! use secmon_client::model::{EventMessage, EventSet, EventType};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! let service = LoopbackService::new(Codec::default());
//! let client = Client::new(service.factory(), runtime.handle().clone());
//!
//! client.set_notify_handler(|message: EventMessage| {
//!     println!("{} from {}", message.event_type, message.process.path);
//! });
//! client.try_activate()?;
//! client.subscribe(&EventSet::from([EventType::NOTIFY_EXEC]))?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::codec::{encode_events, Codec, InvertMutingType, MuteProcessRule, MutePathType};
use crate::config::{ClientConfig, ConverterConfig};
use crate::ipc::{
    AuthHandler, ChannelFactory, ClientError, ConnectionManager, ConnectionState,
    CustomMessageHandler, Dispatcher, Executor, NotifyHandler, PathInterestHandler, SerialQueue,
    ServiceDelegate, ServiceReply, ServiceRequest, StateHandler, SyncBridge,
};
use crate::model::EventSet;

/// Control surface for the security service.
///
/// Control operations block the calling thread for up to the configured
/// timeout and run one at a time. Do not call them from a tokio worker
/// thread.
pub struct Client {
    codec: Codec,
    timeout: Mutex<Duration>,
    bridge: Arc<SyncBridge>,
    dispatcher: Arc<Dispatcher>,
    connection: ConnectionManager,
    state_queue: SerialQueue,
    state_handler: Arc<RwLock<Option<StateHandler>>>,
}

impl Client {
    /// Creates a client with the default configuration.
    ///
    /// Nothing is connected until [`try_activate`](Self::try_activate) or
    /// [`activate`](Self::activate).
    #[must_use]
    pub fn new(factory: ChannelFactory, runtime: Handle) -> Self {
        Self::with_config(factory, runtime, &ClientConfig::default())
    }

    /// Creates a client from `config`.
    #[must_use]
    pub fn with_config(factory: ChannelFactory, runtime: Handle, config: &ClientConfig) -> Self {
        let codec = Codec::new(config.codec.clone());
        let handler_queue = SerialQueue::new("secmon.handlers", &runtime);
        let dispatcher = Arc::new(Dispatcher::new(codec.clone(), Arc::new(handler_queue)));
        let connection = ConnectionManager::new(
            factory,
            Arc::clone(&dispatcher) as Arc<dyn ServiceDelegate>,
            codec.clone(),
            runtime.clone(),
        );
        connection.set_reconnect_delay(config.reconnect_delay());
        connection.set_session_timeout(config.timeout());
        connection.set_converter(config.converter.clone());

        let bridge = Arc::new(SyncBridge::new());
        let state_queue = SerialQueue::new("secmon.state", &runtime);
        let state_handler: Arc<RwLock<Option<StateHandler>>> = Arc::new(RwLock::new(None));

        let relay_bridge = Arc::clone(&bridge);
        let relay_queue = state_queue.clone();
        let relay_handler = Arc::clone(&state_handler);
        connection.set_state_handler(Arc::new(move |outcome: Result<(), ClientError>| {
            if matches!(
                outcome,
                Err(ClientError::Interrupted | ClientError::ChannelInvalidated)
            ) && relay_bridge.fail_pending(ClientError::NotConnected)
            {
                tracing::debug!("Failed in-flight call after connection loss");
            }
            let handler = relay_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(handler) = handler {
                relay_queue.execute(Box::new(move || handler(outcome)));
            }
        }));

        Self {
            codec,
            timeout: Mutex::new(config.timeout()),
            bridge,
            dispatcher,
            connection,
            state_queue,
            state_handler,
        }
    }

    /// Sets the timeout for blocking control calls.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Also bounds how long a (re)connect waits for the service to open the
    /// session.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
        self.connection.set_session_timeout(timeout);
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        self.connection.reconnect_delay()
    }

    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.connection.set_reconnect_delay(delay);
    }

    #[must_use]
    pub fn converter_config(&self) -> ConverterConfig {
        self.connection.converter()
    }

    /// Takes effect on the next (re)connect.
    pub fn set_converter_config(&self, converter: ConverterConfig) {
        self.connection.set_converter(converter);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Execution context for inbound handlers. Defaults to a serial queue.
    pub fn set_queue(&self, executor: Arc<dyn Executor>) {
        self.dispatcher.set_executor(executor);
    }

    /// Handler for path interest queries. It runs while the service waits.
    pub fn set_path_interest_handler(&self, handler: impl PathInterestHandler + 'static) {
        let handler: Arc<dyn PathInterestHandler> = Arc::new(handler);
        self.dispatcher
            .update_handlers(|handlers| handlers.path_interest = Some(handler));
    }

    pub fn set_auth_handler(&self, handler: impl AuthHandler + 'static) {
        let handler: Arc<dyn AuthHandler> = Arc::new(handler);
        self.dispatcher
            .update_handlers(|handlers| handlers.auth = Some(handler));
    }

    pub fn set_notify_handler(&self, handler: impl NotifyHandler + 'static) {
        let handler: Arc<dyn NotifyHandler> = Arc::new(handler);
        self.dispatcher
            .update_handlers(|handlers| handlers.notify = Some(handler));
    }

    pub fn set_custom_message_handler(&self, handler: impl CustomMessageHandler + 'static) {
        let handler: Arc<dyn CustomMessageHandler> = Arc::new(handler);
        self.dispatcher
            .update_handlers(|handlers| handlers.custom_message = Some(handler));
    }

    /// Removes every inbound handler.
    pub fn clear_handlers(&self) {
        self.dispatcher
            .update_handlers(|handlers| *handlers = crate::ipc::HandlerSet::default());
    }

    /// Receives `Ok(())` on every (re)connect and the error on every
    /// connection failure, on a dedicated queue. Blocking calls are allowed
    /// inside, so this is the place to replay subscriptions and mutes.
    pub fn set_connection_state_handler<F>(&self, handler: F)
    where
        F: Fn(Result<(), ClientError>) + Send + Sync + 'static,
    {
        *self
            .state_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Connects and blocks until the session is open.
    ///
    /// # Errors
    ///
    /// Returns the connection outcome: [`ClientError::Timeout`],
    /// [`ClientError::ChannelInvalidated`], [`ClientError::Unexpected`] if an
    /// activation is already running, or the channel's own error.
    pub fn try_activate(&self) -> Result<(), ClientError> {
        let result = self.connection.connect(self.timeout());
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Activation failed");
        }
        result
    }

    /// Connects without blocking; `completion` runs on the state queue.
    pub fn activate<F>(&self, completion: F)
    where
        F: FnOnce(Result<(), ClientError>) + Send + 'static,
    {
        let queue = self.state_queue.clone();
        self.connection.connect_with(move |outcome| {
            queue.execute(Box::new(move || completion(outcome)));
        });
    }

    /// Disconnects for good. Fails an in-flight call with
    /// [`ClientError::NotConnected`]; later calls fail with
    /// [`ClientError::ChannelInvalidated`].
    pub fn invalidate(&self) {
        self.connection.invalidate();
        self.bridge.fail_pending(ClientError::NotConnected);
    }

    /// Adds events to the subscription set.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`], [`ClientError::ChannelInvalidated`],
    /// [`ClientError::Timeout`] or [`ClientError::Remote`].
    pub fn subscribe(&self, events: &EventSet) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::Subscribe {
            events: encode_events(events),
        })
    }

    /// Removes events from the subscription set; other subscriptions stay.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, events: &EventSet) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::Unsubscribe {
            events: encode_events(events),
        })
    }

    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn unsubscribe_all(&self) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::UnsubscribeAll)
    }

    /// Drops the service's cached authorization resolutions.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn clear_cache(&self) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::ClearCache)
    }

    /// Drops the service's cached interest verdicts.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn clear_path_interest_cache(&self) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::ClearPathInterestCache)
    }

    /// Mutes `events` for processes matching `rule`, on top of what is
    /// already muted for the rule.
    ///
    /// # Errors
    ///
    /// [`ClientError::EncodeFailure`] plus the errors of
    /// [`subscribe`](Self::subscribe).
    pub fn mute_process(&self, rule: &MuteProcessRule, events: &EventSet) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::MuteProcess {
            rule: self.codec.encode_process_rule(rule)?,
            events: encode_events(events),
        })
    }

    /// Unmutes `events` for `rule`; other muted events of the rule stay.
    ///
    /// # Errors
    ///
    /// Same as [`mute_process`](Self::mute_process).
    pub fn unmute_process(
        &self,
        rule: &MuteProcessRule,
        events: &EventSet,
    ) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::UnmuteProcess {
            rule: self.codec.encode_process_rule(rule)?,
            events: encode_events(events),
        })
    }

    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn mute_path(
        &self,
        path: &str,
        path_type: MutePathType,
        events: &EventSet,
    ) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::MutePath {
            path: path.to_string(),
            path_type,
            events: encode_events(events),
        })
    }

    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn unmute_path(
        &self,
        path: &str,
        path_type: MutePathType,
        events: &EventSet,
    ) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::UnmutePath {
            path: path.to_string(),
            path_type,
            events: encode_events(events),
        })
    }

    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn unmute_all_processes(&self) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::UnmuteAllProcesses)
    }

    /// Clears process path mutes; target path mutes stay.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn unmute_all_paths(&self) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::UnmuteAllPaths)
    }

    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn unmute_all_target_paths(&self) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::UnmuteAllTargetPaths)
    }

    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn invert_muting(&self, mute_type: InvertMutingType, invert: bool) -> Result<(), ClientError> {
        self.call_done(ServiceRequest::InvertMuting { mute_type, invert })
    }

    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe), or [`ClientError::Unexpected`]
    /// if the service answers with something other than a flag.
    pub fn muting_inverted(&self, mute_type: InvertMutingType) -> Result<bool, ClientError> {
        match self.call(ServiceRequest::MutingInverted { mute_type })? {
            ServiceReply::Flag(inverted) => Ok(inverted),
            other => Err(ClientError::Unexpected(format!(
                "expected a flag reply, got {other:?}"
            ))),
        }
    }

    /// Sends an opaque payload to the service without blocking.
    ///
    /// `completion` runs when the service replies or the channel fails. It
    /// runs immediately with [`ClientError::NotConnected`] or
    /// [`ClientError::ChannelInvalidated`] when there is no channel.
    pub fn send_custom_message<F>(&self, data: Vec<u8>, completion: F)
    where
        F: FnOnce(Result<Vec<u8>, ClientError>) + Send + 'static,
    {
        match self.connection.proxy() {
            Some(proxy) => proxy.send_custom_message(
                data,
                Box::new(move |reply| completion(reply.map_err(ClientError::Remote))),
            ),
            None => completion(Err(self.disconnected_error())),
        }
    }

    fn disconnected_error(&self) -> ClientError {
        match self.connection.state() {
            ConnectionState::Invalidated => ClientError::ChannelInvalidated,
            _ => ClientError::NotConnected,
        }
    }

    fn call(&self, request: ServiceRequest) -> Result<ServiceReply, ClientError> {
        let operation = request.name();
        let result = self.bridge.invoke(self.timeout(), |done| {
            let Some(proxy) = self.connection.proxy() else {
                done.complete(Err(self.disconnected_error()));
                return;
            };
            proxy.call(
                request,
                Box::new(move |reply| {
                    done.complete(reply.map_err(ClientError::Remote));
                }),
            );
        });

        match &result {
            Ok(_) => tracing::trace!(operation, "Control call completed"),
            Err(e) => tracing::debug!(operation, error = %e, "Control call failed"),
        }
        result
    }

    fn call_done(&self, request: ServiceRequest) -> Result<(), ClientError> {
        match self.call(request)? {
            ServiceReply::Done => Ok(()),
            other => Err(ClientError::Unexpected(format!(
                "expected an empty reply, got {other:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("timeout", &self.timeout())
            .field("connection", &self.connection)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::LoopbackService;

    fn client(runtime: &tokio::runtime::Runtime) -> (Client, Arc<LoopbackService>) {
        let service = LoopbackService::new(Codec::default());
        let client = Client::new(service.factory(), runtime.handle().clone())
            .with_timeout(Duration::from_millis(500));
        (client, service)
    }

    #[test]
    fn client_defaults_follow_config() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = LoopbackService::new(Codec::default());
        let config = ClientConfig {
            timeout_ms: 1500,
            reconnect_delay_ms: 20,
            ..Default::default()
        };
        let client = Client::with_config(service.factory(), runtime.handle().clone(), &config);
        assert_eq!(client.timeout(), Duration::from_millis(1500));
        assert_eq!(client.reconnect_delay(), Duration::from_millis(20));
        assert_eq!(client.connection.session_timeout(), Duration::from_millis(1500));
        assert_eq!(client.converter_config(), ConverterConfig::default());
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[test]
    fn muting_inverted_reads_flag() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (client, service) = client(&runtime);
        client.try_activate().unwrap();

        assert!(!client.muting_inverted(InvertMutingType::Path).unwrap());
        client.invert_muting(InvertMutingType::Path, true).unwrap();
        assert!(client.muting_inverted(InvertMutingType::Path).unwrap());
        assert!(service.muting_inverted(InvertMutingType::Path));
        assert!(!service.muting_inverted(InvertMutingType::Process));
    }

    #[test]
    fn lost_channel_fails_calls_fast() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (client, service) = client(&runtime);
        client.try_activate().unwrap();
        service.invalidate_connection();

        // The channel is gone until the scheduled reconnect.
        assert_eq!(
            client.subscribe(&EventSet::new()),
            Err(ClientError::NotConnected)
        );
    }

    #[test]
    fn handlers_run_on_replacement_queue() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (client, service) = client(&runtime);
        client.set_queue(Arc::new(crate::ipc::PoolExecutor::new(
            runtime.handle().clone(),
        )));
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        client.set_notify_handler(move |message: crate::model::EventMessage| {
            let _ = tx.lock().unwrap().send(message.process.pid);
        });
        client.try_activate().unwrap();
        client
            .subscribe(&EventSet::from([crate::model::EventType::NOTIFY_CLOSE]))
            .unwrap();

        let process = crate::model::ProcessDescriptor::new(31, "/bin/cp");
        assert!(service.emit_notify(&crate::model::EventMessage::notify(
            crate::model::EventType::NOTIFY_CLOSE,
            process,
        )));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 31);

        client.clear_handlers();
        assert!(client.dispatcher.handlers().notify.is_none());
    }

    #[test]
    fn converter_config_reaches_service() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (client, service) = client(&runtime);
        client.set_converter_config(ConverterConfig { version: 7 });
        client.try_activate().unwrap();
        assert_eq!(service.converter(), Some(ConverterConfig { version: 7 }));
    }
}
