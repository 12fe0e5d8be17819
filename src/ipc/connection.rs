//! Connection lifecycle.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Interrupted -> Connecting -> ...
//!                  \________________________________\-> Invalidated
//! ```
//!
//! The manager creates a channel through the caller's factory, opens a session
//! on it and publishes every transition into `Connected` (and every failure the
//! caller needs to know about) to a single state handler. When the channel
//! reports that the service went away, the manager schedules a reconnect after
//! the reconnect delay. The service forgets all client state when the channel
//! is recreated; replaying subscriptions and mutes is up to the state handler.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::{
    Channel, ChannelContext, ChannelFactory, ClientError, RemoteResult, ServiceDelegate,
    ServiceRequest, SyncBridge,
};
use crate::codec::Codec;
use crate::config::ConverterConfig;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// The channel died; a reconnect is scheduled.
    Interrupted,
    /// Terminal.
    Invalidated,
}

/// Receives connection outcomes: `Ok(())` on every successful (re)connect,
/// an error on failures.
pub type StateHandler = Arc<dyn Fn(Result<(), ClientError>) + Send + Sync>;

type Waiter = Box<dyn FnOnce(Result<(), ClientError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Manual,
    Automatic,
}

/// Handle a channel uses to report that it is no longer usable.
///
/// Reports from a channel that has already been replaced are ignored.
#[derive(Clone)]
pub struct ChannelEvents {
    generation: u64,
    shared: Weak<Shared>,
}

impl ChannelEvents {
    /// The service process died or the connection was interrupted.
    pub fn interrupted(&self) {
        self.lost("interrupted");
    }

    /// The connection was invalidated out-of-band.
    pub fn invalidated(&self) {
        self.lost("invalidated");
    }

    /// Connection attempt this handle belongs to.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn lost(&self, reason: &'static str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.channel_lost(self.generation, reason);
        }
    }
}

impl std::fmt::Debug for ChannelEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEvents")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    attempt: Attempt,
    channel: Option<Arc<dyn Channel>>,
    converter: ConverterConfig,
    reconnect_delay: Duration,
    session_timeout: Duration,
    subscriber: Option<StateHandler>,
    waiters: Vec<Waiter>,
}

impl Inner {
    fn transition(&mut self, to: ConnectionState) {
        tracing::debug!(from = ?self.state, to = ?to, "Connection state transition");
        self.state = to;
    }
}

struct Shared {
    factory: ChannelFactory,
    delegate: Arc<dyn ServiceDelegate>,
    codec: Codec,
    runtime: Handle,
    shutdown: CancellationToken,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts an attempt. Returns its generation if a session request went
    /// out.
    fn attempt(self: &Arc<Self>, kind: Attempt, waiter: Option<Waiter>) -> Option<u64> {
        let generation = {
            let mut inner = self.lock();
            let early = match (inner.state, kind) {
                (ConnectionState::Invalidated, _) => Some(Err(ClientError::ChannelInvalidated)),
                (ConnectionState::Connected, Attempt::Manual) => Some(Ok(())),
                (ConnectionState::Connecting, Attempt::Manual) => Some(Err(
                    ClientError::Unexpected("connection attempt already in progress".to_string()),
                )),
                (ConnectionState::Idle | ConnectionState::Interrupted, Attempt::Manual)
                | (ConnectionState::Interrupted, Attempt::Automatic) => None,
                (_, Attempt::Automatic) => {
                    tracing::trace!(state = ?inner.state, "Skipping scheduled reconnect");
                    return None;
                }
            };
            if let Some(outcome) = early {
                drop(inner);
                if let Some(waiter) = waiter {
                    waiter(outcome);
                }
                return None;
            }

            inner.transition(ConnectionState::Connecting);
            inner.generation += 1;
            inner.attempt = kind;
            inner.waiters.extend(waiter);
            inner.generation
        };

        tracing::debug!(generation, attempt = ?kind, "Creating channel");
        let context = ChannelContext {
            delegate: Arc::clone(&self.delegate),
            events: ChannelEvents {
                generation,
                shared: Arc::downgrade(self),
            },
        };
        let channel = match (self.factory)(context) {
            Ok(channel) => channel,
            Err(e) => {
                self.attempt_failed(generation, e);
                return None;
            }
        };

        let converter = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                drop(inner);
                channel.invalidate();
                return None;
            }
            inner.channel = Some(Arc::clone(&channel));
            inner.converter.clone()
        };

        let payload = match self.codec.encode(&converter) {
            Ok(payload) => payload,
            Err(e) => {
                self.attempt_failed(generation, e);
                return None;
            }
        };

        self.watch_session(generation);
        let weak = Arc::downgrade(self);
        channel.call(
            ServiceRequest::CreateSession { converter: payload },
            Box::new(move |reply| {
                if let Some(shared) = weak.upgrade() {
                    shared.session_created(generation, reply);
                }
            }),
        );
        Some(generation)
    }

    /// Fails the attempt `generation` if its session is still not open after
    /// the session timeout.
    fn watch_session(self: &Arc<Self>, generation: u64) {
        let timeout = self.lock().session_timeout;
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        self.runtime.spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if let Some(shared) = weak.upgrade() {
                        shared.attempt_failed(generation, ClientError::Timeout(millis(timeout)));
                    }
                }
            }
        });
    }

    fn session_created(self: &Arc<Self>, generation: u64, reply: RemoteResult) {
        if let Err(message) = reply {
            self.attempt_failed(generation, ClientError::Remote(message));
            return;
        }

        let (subscriber, waiters) = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                return;
            }
            inner.transition(ConnectionState::Connected);
            (inner.subscriber.clone(), std::mem::take(&mut inner.waiters))
        };

        tracing::info!(generation, "Connected to security service");
        publish(subscriber, waiters, Ok(()));
    }

    fn attempt_failed(self: &Arc<Self>, generation: u64, error: ClientError) {
        let (channel, outcome) = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                return;
            }
            let channel = inner.channel.take();
            let outcome = match inner.attempt {
                Attempt::Manual => {
                    inner.transition(ConnectionState::Idle);
                    Some((inner.subscriber.clone(), std::mem::take(&mut inner.waiters)))
                }
                Attempt::Automatic => {
                    inner.transition(ConnectionState::Interrupted);
                    None
                }
            };
            (channel, outcome)
        };

        if let Some(channel) = channel {
            channel.invalidate();
        }

        match outcome {
            Some((subscriber, waiters)) => {
                tracing::warn!(error = %error, "Connection attempt failed");
                publish(subscriber, waiters, Err(error));
            }
            None => {
                tracing::warn!(error = %error, "Reconnect attempt failed, retrying");
                self.schedule_reconnect();
            }
        }
    }

    fn channel_lost(self: &Arc<Self>, generation: u64, reason: &'static str) {
        let (subscriber, waiters, publish_loss) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                tracing::trace!(generation, reason, "Ignoring event from stale channel");
                return;
            }
            if !matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return;
            }
            let publish_loss =
                inner.state == ConnectionState::Connected || inner.attempt == Attempt::Manual;
            inner.transition(ConnectionState::Interrupted);
            inner.attempt = Attempt::Automatic;
            inner.channel = None;
            (
                inner.subscriber.clone(),
                std::mem::take(&mut inner.waiters),
                publish_loss,
            )
        };

        tracing::warn!(generation, reason, "Connection to security service lost");
        if publish_loss {
            publish(subscriber, waiters, Err(ClientError::Interrupted));
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let delay = self.lock().reconnect_delay;
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tracing::debug!(delay_ms = delay.as_millis(), "Scheduling reconnect");
        self.runtime.spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("Reconnect cancelled");
                }
                () = tokio::time::sleep(delay) => {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    // The factory may block.
                    let attempt = tokio::task::spawn_blocking(move || {
                        shared.attempt(Attempt::Automatic, None);
                    });
                    if let Err(e) = attempt.await {
                        tracing::warn!(error = %e, "Reconnect task failed");
                    }
                }
            }
        });
    }

    fn invalidate(&self) {
        let (channel, subscriber, waiters) = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Invalidated {
                return;
            }
            inner.transition(ConnectionState::Invalidated);
            inner.generation += 1;
            (
                inner.channel.take(),
                inner.subscriber.clone(),
                std::mem::take(&mut inner.waiters),
            )
        };

        self.shutdown.cancel();
        if let Some(channel) = channel {
            channel.invalidate();
        }
        tracing::info!("Connection invalidated");
        publish(subscriber, waiters, Err(ClientError::ChannelInvalidated));
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn publish(
    subscriber: Option<StateHandler>,
    waiters: Vec<Waiter>,
    outcome: Result<(), ClientError>,
) {
    for waiter in waiters {
        waiter(outcome.clone());
    }
    if let Some(subscriber) = subscriber {
        subscriber(outcome);
    }
}

/// Owns the channel to the service and keeps it alive.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    connect_bridge: SyncBridge,
}

impl ConnectionManager {
    /// Creates a manager in the `Idle` state. Nothing is connected until
    /// [`connect`](Self::connect) or [`connect_with`](Self::connect_with).
    #[must_use]
    pub fn new(
        factory: ChannelFactory,
        delegate: Arc<dyn ServiceDelegate>,
        codec: Codec,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                delegate,
                codec,
                runtime,
                shutdown: CancellationToken::new(),
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    generation: 0,
                    attempt: Attempt::Manual,
                    channel: None,
                    converter: ConverterConfig::default(),
                    reconnect_delay: Duration::from_secs(3),
                    session_timeout: Duration::from_secs(5),
                    subscriber: None,
                    waiters: Vec::new(),
                }),
            }),
            connect_bridge: SyncBridge::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Installs the single state subscriber, replacing any previous one.
    pub fn set_state_handler(&self, handler: StateHandler) {
        self.shared.lock().subscriber = Some(handler);
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        self.shared.lock().reconnect_delay
    }

    /// Applies to reconnects scheduled from now on.
    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.shared.lock().reconnect_delay = delay;
    }

    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        self.shared.lock().session_timeout
    }

    /// Deadline for the session reply of every attempt started from now on.
    /// An attempt that misses it is abandoned like a failed one.
    pub fn set_session_timeout(&self, timeout: Duration) {
        self.shared.lock().session_timeout = timeout;
    }

    #[must_use]
    pub fn converter(&self) -> ConverterConfig {
        self.shared.lock().converter.clone()
    }

    /// Sent to the service on the next (re)connect.
    pub fn set_converter(&self, converter: ConverterConfig) {
        self.shared.lock().converter = converter;
    }

    /// The current channel, available only while connected.
    #[must_use]
    pub fn proxy(&self) -> Option<Arc<dyn Channel>> {
        let inner = self.shared.lock();
        match inner.state {
            ConnectionState::Connected => inner.channel.clone(),
            _ => None,
        }
    }

    /// Connects and blocks until the session is open or `timeout` elapses.
    ///
    /// Succeeds immediately if already connected.
    ///
    /// # Errors
    ///
    /// - [`ClientError::ChannelInvalidated`] after [`invalidate`](Self::invalidate)
    /// - [`ClientError::Unexpected`] if another attempt is in progress
    /// - [`ClientError::Timeout`] if the session did not open in time; the
    ///   attempt is abandoned and a later `connect` starts afresh
    /// - the factory's error, or [`ClientError::Remote`] if the service
    ///   refused the session
    pub fn connect(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut started = None;
        let result = self.connect_bridge.invoke(timeout, |done| {
            started = self.shared.attempt(
                Attempt::Manual,
                Some(Box::new(move |outcome| {
                    done.complete(outcome);
                })),
            );
        });

        match (result, started) {
            (Err(ClientError::Timeout(ms)), Some(generation)) => {
                // Nobody waits for this attempt anymore.
                self.shared
                    .attempt_failed(generation, ClientError::Timeout(ms));
                match self.state() {
                    ConnectionState::Connected => Ok(()),
                    _ => Err(ClientError::Timeout(ms)),
                }
            }
            (result, _) => result,
        }
    }

    /// Starts connecting and reports the outcome to `completion`.
    pub fn connect_with<F>(&self, completion: F)
    where
        F: FnOnce(Result<(), ClientError>) + Send + 'static,
    {
        self.shared.attempt(Attempt::Manual, Some(Box::new(completion)));
    }

    /// Tears the connection down for good. No reconnect happens afterwards.
    pub fn invalidate(&self) {
        self.shared.invalidate();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.invalidate();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("reconnect_delay", &inner.reconnect_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{ReplyFn, ServiceReply};
    use std::sync::mpsc;

    struct NullDelegate;

    impl ServiceDelegate for NullDelegate {
        fn handle_path_interest(&self, _payload: &[u8]) -> Option<Vec<u8>> {
            None
        }
        fn handle_auth(&self, _payload: &[u8], reply: ReplyFn<(u32, bool)>) {
            reply((u32::MAX, false));
        }
        fn handle_notify(&self, _payload: &[u8]) {}
        fn handle_custom_message(&self, _payload: &[u8], reply: ReplyFn<Result<Vec<u8>, String>>) {
            reply(Err("unsupported".to_string()));
        }
    }

    /// Accepts every session and remembers the last channel's events handle.
    #[derive(Default)]
    struct FakeService {
        sessions: Mutex<Vec<ConverterConfig>>,
        events: Mutex<Option<ChannelEvents>>,
        refuse: Mutex<Option<String>>,
        /// Swallows session requests without replying.
        silent: Mutex<bool>,
    }

    struct FakeChannel {
        service: Arc<FakeService>,
    }

    impl Channel for FakeChannel {
        fn call(&self, request: ServiceRequest, reply: ReplyFn<RemoteResult>) {
            if let ServiceRequest::CreateSession { converter } = request {
                if *self.service.silent.lock().unwrap() {
                    return;
                }
                if let Some(reason) = self.service.refuse.lock().unwrap().clone() {
                    reply(Err(reason));
                    return;
                }
                let config = Codec::default().decode(&converter).unwrap();
                self.service.sessions.lock().unwrap().push(config);
            }
            reply(Ok(ServiceReply::Done));
        }

        fn send_custom_message(&self, data: Vec<u8>, reply: ReplyFn<Result<Vec<u8>, String>>) {
            reply(Ok(data));
        }

        fn invalidate(&self) {}
    }

    fn manager(service: &Arc<FakeService>, runtime: &tokio::runtime::Runtime) -> ConnectionManager {
        let service = Arc::clone(service);
        let factory: ChannelFactory = Arc::new(move |context: ChannelContext| {
            *service.events.lock().unwrap() = Some(context.events);
            Ok(Arc::new(FakeChannel {
                service: Arc::clone(&service),
            }) as Arc<dyn Channel>)
        });
        ConnectionManager::new(
            factory,
            Arc::new(NullDelegate),
            Codec::default(),
            runtime.handle().clone(),
        )
    }

    #[test]
    fn connect_opens_session_with_converter() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = Arc::new(FakeService::default());
        let manager = manager(&service, &runtime);
        manager.set_converter(ConverterConfig { version: 3 });

        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.proxy().is_none());

        manager.connect(Duration::from_secs(1)).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.proxy().is_some());
        assert_eq!(
            *service.sessions.lock().unwrap(),
            vec![ConverterConfig { version: 3 }]
        );

        // Already connected.
        manager.connect(Duration::from_secs(1)).unwrap();
        assert_eq!(service.sessions.lock().unwrap().len(), 1);
    }

    #[test]
    fn factory_failure_is_published_and_returns_to_idle() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let factory: ChannelFactory = Arc::new(|_| Err(ClientError::NotConnected));
        let manager = ConnectionManager::new(
            factory,
            Arc::new(NullDelegate),
            Codec::default(),
            runtime.handle().clone(),
        );
        let (tx, rx) = mpsc::channel();
        manager.set_state_handler(Arc::new(move |outcome| {
            let _ = tx.send(outcome);
        }));

        let result = manager.connect(Duration::from_secs(1));
        assert_eq!(result, Err(ClientError::NotConnected));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(rx.recv().unwrap(), Err(ClientError::NotConnected));
    }

    #[test]
    fn refused_session_is_a_remote_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = Arc::new(FakeService::default());
        *service.refuse.lock().unwrap() = Some("not entitled".to_string());
        let manager = manager(&service, &runtime);

        let result = manager.connect(Duration::from_secs(1));
        assert_eq!(result, Err(ClientError::Remote("not entitled".to_string())));
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[test]
    fn interruption_triggers_reconnect_after_delay() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = Arc::new(FakeService::default());
        let manager = manager(&service, &runtime);
        manager.set_reconnect_delay(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel();
        manager.set_state_handler(Arc::new(move |outcome| {
            let _ = tx.send(outcome);
        }));

        manager.connect(Duration::from_secs(1)).unwrap();
        assert_eq!(rx.recv().unwrap(), Ok(()));

        let events = service.events.lock().unwrap().clone().unwrap();
        events.interrupted();
        assert_eq!(manager.state(), ConnectionState::Interrupted);
        assert!(manager.proxy().is_none());
        assert_eq!(rx.recv().unwrap(), Err(ClientError::Interrupted));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(()));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(service.sessions.lock().unwrap().len(), 2);

        // The old channel is stale now.
        events.interrupted();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn invalidate_is_terminal_and_cancels_reconnect() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = Arc::new(FakeService::default());
        let manager = manager(&service, &runtime);
        manager.set_reconnect_delay(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel();
        manager.set_state_handler(Arc::new(move |outcome| {
            let _ = tx.send(outcome);
        }));

        manager.connect(Duration::from_secs(1)).unwrap();
        assert_eq!(rx.recv().unwrap(), Ok(()));
        service.events.lock().unwrap().clone().unwrap().interrupted();
        assert_eq!(rx.recv().unwrap(), Err(ClientError::Interrupted));

        manager.invalidate();
        assert_eq!(rx.recv().unwrap(), Err(ClientError::ChannelInvalidated));
        assert_eq!(manager.state(), ConnectionState::Invalidated);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(manager.state(), ConnectionState::Invalidated);
        assert_eq!(service.sessions.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());

        assert_eq!(
            manager.connect(Duration::from_secs(1)),
            Err(ClientError::ChannelInvalidated)
        );
    }

    #[test]
    fn timed_out_connect_can_be_retried() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = Arc::new(FakeService::default());
        let manager = manager(&service, &runtime);
        *service.silent.lock().unwrap() = true;

        assert_eq!(
            manager.connect(Duration::from_millis(100)),
            Err(ClientError::Timeout(100))
        );
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.proxy().is_none());

        *service.silent.lock().unwrap() = false;
        manager.connect(Duration::from_secs(1)).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(service.sessions.lock().unwrap().len(), 1);
    }

    #[test]
    fn async_connect_gives_up_after_session_timeout() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = Arc::new(FakeService::default());
        let manager = manager(&service, &runtime);
        manager.set_session_timeout(Duration::from_millis(100));
        *service.silent.lock().unwrap() = true;

        let (tx, rx) = mpsc::channel();
        manager.connect_with(move |outcome| {
            let _ = tx.send(outcome);
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Err(ClientError::Timeout(100))
        );
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[test]
    fn stalled_reconnect_is_retried() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = Arc::new(FakeService::default());
        let manager = manager(&service, &runtime);
        manager.set_reconnect_delay(Duration::from_millis(20));
        manager.set_session_timeout(Duration::from_millis(100));
        let (tx, rx) = mpsc::channel();
        manager.set_state_handler(Arc::new(move |outcome| {
            let _ = tx.send(outcome);
        }));

        manager.connect(Duration::from_secs(1)).unwrap();
        assert_eq!(rx.recv().unwrap(), Ok(()));

        *service.silent.lock().unwrap() = true;
        service.events.lock().unwrap().clone().unwrap().interrupted();
        assert_eq!(rx.recv().unwrap(), Err(ClientError::Interrupted));

        // Several reconnect sessions go unanswered; none of them is published.
        std::thread::sleep(Duration::from_millis(350));
        assert!(rx.try_recv().is_err());
        assert_ne!(manager.state(), ConnectionState::Connected);

        *service.silent.lock().unwrap() = false;
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(()));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }
}
