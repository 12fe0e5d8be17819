//! In-process security service.
//!
//! [`LoopbackService`] plays the privileged side of the channel inside the
//! current process. It keeps the per-client tables a real service keeps
//! (subscriptions, process and path mutes, inversions, interest and
//! resolution caches) and forgets them whenever a new channel is bound, just
//! like the real service does when the connection is recreated.
//!
//! It can also misbehave on request: refuse connections, interrupt the current
//! channel, hold replies forever or delay them. The demo binary and the
//! integration tests drive the client against it.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    Channel, ChannelContext, ChannelEvents, ChannelFactory, ClientError, RemoteResult, ReplyFn,
    ServiceDelegate, ServiceReply, ServiceRequest,
};
use crate::codec::{decode_events, Codec, InvertMutingType, MuteProcessRule, MutePathType};
use crate::config::ConverterConfig;
use crate::model::{EventMessage, EventSet, EventType, InterestVerdict, Resolution};

type CustomResponder = Arc<dyn Fn(Vec<u8>) -> Result<Vec<u8>, String> + Send + Sync>;
type HeldReply = Box<dyn FnOnce() + Send>;

/// What happened to an emitted authorization event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Filtered out by subscriptions, mutes or interest.
    NotDelivered,
    /// Answered from the resolution cache without asking the client.
    Cached(Resolution),
    Resolved(Resolution),
    /// The client did not answer before the deadline.
    TimedOut,
}

struct Binding {
    id: u64,
    delegate: Arc<dyn ServiceDelegate>,
    events: ChannelEvents,
}

/// Per-client state, dropped on every new channel.
#[derive(Default)]
struct ClientTables {
    subscriptions: EventSet,
    muted_processes: HashMap<MuteProcessRule, EventSet>,
    muted_paths: HashMap<(String, MutePathType), EventSet>,
    inverted: HashSet<InvertMutingType>,
    interest_cache: HashMap<String, Option<InterestVerdict>>,
    resolution_cache: HashMap<(String, EventType), Resolution>,
}

impl ClientTables {
    fn is_muted(&self, message: &EventMessage) -> bool {
        let event = message.event_type;

        let process_muted = self
            .muted_processes
            .iter()
            .any(|(rule, events)| events.contains(event) && rule.matches(&message.process));
        let process_muted = process_muted != self.inverted.contains(&InvertMutingType::Process);

        let path_muted = self.path_muted(event, &message.process.path, false);
        let path_muted = path_muted != self.inverted.contains(&InvertMutingType::Path);

        let target_muted = message
            .event
            .get("target")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|target| {
                self.path_muted(event, target, true)
                    != self.inverted.contains(&InvertMutingType::TargetPath)
            });

        process_muted || path_muted || target_muted
    }

    fn path_muted(&self, event: EventType, candidate: &str, target: bool) -> bool {
        self.muted_paths.iter().any(|((path, path_type), events)| {
            path_type.is_target() == target
                && events.contains(event)
                && path_type.matches(path, candidate)
        })
    }
}

struct ServiceState {
    binding: Option<Binding>,
    next_channel_id: u64,
    tables: ClientTables,
    converter: Option<ConverterConfig>,
    sessions: usize,
    available: bool,
    unresponsive: bool,
    reply_delay: Option<Duration>,
    in_flight: usize,
    max_in_flight: usize,
    requests: Vec<&'static str>,
    custom_responder: Option<CustomResponder>,
}

/// In-process stand-in for the privileged service.
pub struct LoopbackService {
    codec: Codec,
    state: Mutex<ServiceState>,
    held: Mutex<Vec<HeldReply>>,
}

impl LoopbackService {
    #[must_use]
    pub fn new(codec: Codec) -> Arc<Self> {
        Arc::new(Self {
            codec,
            state: Mutex::new(ServiceState {
                binding: None,
                next_channel_id: 0,
                tables: ClientTables::default(),
                converter: None,
                sessions: 0,
                available: true,
                unresponsive: false,
                reply_delay: None,
                in_flight: 0,
                max_in_flight: 0,
                requests: Vec::new(),
                custom_responder: None,
            }),
            held: Mutex::new(Vec::new()),
        })
    }

    /// Factory binding a fresh channel to this service on every call.
    #[must_use]
    pub fn factory(self: &Arc<Self>) -> ChannelFactory {
        let service = Arc::clone(self);
        Arc::new(move |context: ChannelContext| service.bind(context))
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind(self: &Arc<Self>, context: ChannelContext) -> Result<Arc<dyn Channel>, ClientError> {
        let mut state = self.lock();
        if !state.available {
            return Err(ClientError::Remote("security service unavailable".to_string()));
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.binding = Some(Binding {
            id,
            delegate: context.delegate,
            events: context.events,
        });
        state.tables = ClientTables::default();
        tracing::debug!(channel = id, "Loopback channel bound");

        Ok(Arc::new(LoopbackChannel {
            id,
            service: Arc::clone(self),
        }))
    }

    fn is_current(&self, id: u64) -> bool {
        self.lock().binding.as_ref().is_some_and(|b| b.id == id)
    }

    fn unbind(&self, id: u64) {
        let mut state = self.lock();
        if state.binding.as_ref().is_some_and(|b| b.id == id) {
            state.binding = None;
            tracing::debug!(channel = id, "Loopback channel invalidated by client");
        }
    }

    fn apply(&self, request: ServiceRequest) -> RemoteResult {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.requests.push(request.name());
        let tables = &mut state.tables;

        match request {
            ServiceRequest::CreateSession { converter } => {
                let converter: ConverterConfig =
                    self.codec.decode(&converter).map_err(|e| e.to_string())?;
                state.converter = Some(converter);
                state.sessions += 1;
            }
            ServiceRequest::ClearPathInterestCache => tables.interest_cache.clear(),
            ServiceRequest::MuteProcess { rule, events } => {
                let rule = self.codec.decode_process_rule(&rule).map_err(|e| e.to_string())?;
                let events = event_set(&events)?;
                tables
                    .muted_processes
                    .entry(rule)
                    .or_default()
                    .union_with(&events);
            }
            ServiceRequest::UnmuteProcess { rule, events } => {
                let rule = self.codec.decode_process_rule(&rule).map_err(|e| e.to_string())?;
                let events = event_set(&events)?;
                if let Some(muted) = tables.muted_processes.get_mut(&rule) {
                    muted.subtract(&events);
                    if muted.is_empty() {
                        tables.muted_processes.remove(&rule);
                    }
                }
            }
            ServiceRequest::MutePath {
                path,
                path_type,
                events,
            } => {
                let events = event_set(&events)?;
                tables
                    .muted_paths
                    .entry((path, path_type))
                    .or_default()
                    .union_with(&events);
            }
            ServiceRequest::UnmutePath {
                path,
                path_type,
                events,
            } => {
                let events = event_set(&events)?;
                let key = (path, path_type);
                if let Some(muted) = tables.muted_paths.get_mut(&key) {
                    muted.subtract(&events);
                    if muted.is_empty() {
                        tables.muted_paths.remove(&key);
                    }
                }
            }
            ServiceRequest::UnmuteAllProcesses => tables.muted_processes.clear(),
            ServiceRequest::UnmuteAllPaths => {
                tables.muted_paths.retain(|(_, path_type), _| path_type.is_target());
            }
            ServiceRequest::UnmuteAllTargetPaths => {
                tables.muted_paths.retain(|(_, path_type), _| !path_type.is_target());
            }
            ServiceRequest::Subscribe { events } => {
                tables.subscriptions.union_with(&event_set(&events)?);
            }
            ServiceRequest::Unsubscribe { events } => {
                tables.subscriptions.subtract(&event_set(&events)?);
            }
            ServiceRequest::UnsubscribeAll => tables.subscriptions = EventSet::new(),
            ServiceRequest::ClearCache => tables.resolution_cache.clear(),
            ServiceRequest::InvertMuting { mute_type, invert } => {
                if invert {
                    tables.inverted.insert(mute_type);
                } else {
                    tables.inverted.remove(&mute_type);
                }
            }
            ServiceRequest::MutingInverted { mute_type } => {
                return Ok(ServiceReply::Flag(tables.inverted.contains(&mute_type)));
            }
        }
        Ok(ServiceReply::Done)
    }

    /// Delivers `reply` according to the current reply mode.
    fn respond(self: &Arc<Self>, reply: HeldReply) {
        let (unresponsive, delay) = {
            let mut state = self.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            (state.unresponsive, state.reply_delay)
        };

        let service = Arc::clone(self);
        let finish: HeldReply = Box::new(move || {
            service.lock().in_flight -= 1;
            reply();
        });

        if unresponsive {
            self.held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(finish);
        } else if let Some(delay) = delay {
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                finish();
            });
        } else {
            finish();
        }
    }

    /// Client handle of the current channel, if the event passes the filters.
    fn deliverable(&self, message: &EventMessage) -> Option<Arc<dyn ServiceDelegate>> {
        let state = self.lock();
        let binding = state.binding.as_ref()?;
        let tables = &state.tables;
        if !tables.subscriptions.contains(message.event_type) || tables.is_muted(message) {
            return None;
        }
        let delegate = Arc::clone(&binding.delegate);
        drop(state);

        self.interested(&delegate, message).then_some(delegate)
    }

    fn interested(&self, delegate: &Arc<dyn ServiceDelegate>, message: &EventMessage) -> bool {
        let path = &message.process.path;
        let cached = self.lock().tables.interest_cache.get(path).cloned();
        let verdict = match cached {
            Some(verdict) => verdict,
            None => {
                let verdict = self.codec.encode(&message.process).ok().and_then(|payload| {
                    delegate
                        .handle_path_interest(&payload)
                        .and_then(|reply| self.codec.decode::<InterestVerdict>(&reply).ok())
                });
                self.lock()
                    .tables
                    .interest_cache
                    .insert(path.clone(), verdict.clone());
                verdict
            }
        };
        verdict.map_or(true, |v| !v.ignored.contains(message.event_type))
    }

    /// Emits a notification. Returns whether it reached the client.
    pub fn emit_notify(&self, message: &EventMessage) -> bool {
        let Some(delegate) = self.deliverable(message) else {
            return false;
        };
        match self.codec.encode(message) {
            Ok(payload) => {
                delegate.handle_notify(&payload);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode notification");
                false
            }
        }
    }

    /// Emits an authorization request and waits up to `deadline` for the
    /// client's resolution.
    ///
    /// Must not be called from the client's handler queue.
    pub fn emit_auth(&self, message: &EventMessage, deadline: Duration) -> AuthOutcome {
        let Some(delegate) = self.deliverable(message) else {
            return AuthOutcome::NotDelivered;
        };
        let key = (message.process.path.clone(), message.event_type);
        if let Some(resolution) = self.lock().tables.resolution_cache.get(&key) {
            return AuthOutcome::Cached(*resolution);
        }
        let Ok(payload) = self.codec.encode(message) else {
            return AuthOutcome::NotDelivered;
        };

        let (tx, rx) = mpsc::channel();
        delegate.handle_auth(
            &payload,
            Box::new(move |answer| {
                let _ = tx.send(answer);
            }),
        );
        match rx.recv_timeout(deadline) {
            Ok((code, cache)) => {
                let resolution = Resolution::from_wire(code, cache);
                if resolution.cache {
                    self.lock().tables.resolution_cache.insert(key, resolution);
                }
                AuthOutcome::Resolved(resolution)
            }
            Err(_) => AuthOutcome::TimedOut,
        }
    }

    /// Sends a custom message to the client and waits for its answer.
    ///
    /// # Errors
    ///
    /// Returns the client's error string, `"not connected"` without a
    /// channel, or `"timed out"`.
    pub fn send_custom_message(&self, data: &[u8], deadline: Duration) -> Result<Vec<u8>, String> {
        let delegate = self
            .lock()
            .binding
            .as_ref()
            .map(|b| Arc::clone(&b.delegate))
            .ok_or_else(|| "not connected".to_string())?;

        let (tx, rx) = mpsc::channel();
        delegate.handle_custom_message(
            data,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv_timeout(deadline)
            .map_err(|_| "timed out".to_string())?
    }

    /// Simulates the service process dying. Returns `false` without a channel.
    pub fn interrupt(&self) -> bool {
        let binding = self.lock().binding.take();
        match binding {
            Some(binding) => {
                tracing::debug!(channel = binding.id, "Loopback channel interrupted");
                binding.events.interrupted();
                true
            }
            None => false,
        }
    }

    /// Simulates the connection being invalidated by the system.
    pub fn invalidate_connection(&self) -> bool {
        let binding = self.lock().binding.take();
        match binding {
            Some(binding) => {
                binding.events.invalidated();
                true
            }
            None => false,
        }
    }

    /// While unavailable, new channels cannot be created.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// While unresponsive, replies are held until [`release_held`](Self::release_held).
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    /// Replies are delivered from another thread after `delay`.
    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        self.lock().reply_delay = delay;
    }

    /// Answers client custom messages; the default echoes the payload.
    pub fn set_custom_responder<F>(&self, responder: F)
    where
        F: Fn(Vec<u8>) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.lock().custom_responder = Some(Arc::new(responder));
    }

    /// Delivers every held reply. Returns how many there were.
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut *self.held.lock().unwrap_or_else(PoisonError::into_inner));
        let count = held.len();
        for reply in held {
            reply();
        }
        count
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().binding.is_some()
    }

    /// Number of sessions opened so far.
    #[must_use]
    pub fn sessions(&self) -> usize {
        self.lock().sessions
    }

    /// Converter configuration of the latest session.
    #[must_use]
    pub fn converter(&self) -> Option<ConverterConfig> {
        self.lock().converter.clone()
    }

    #[must_use]
    pub fn subscriptions(&self) -> EventSet {
        self.lock().tables.subscriptions.clone()
    }

    #[must_use]
    pub fn process_mutes(&self, rule: &MuteProcessRule) -> EventSet {
        self.lock()
            .tables
            .muted_processes
            .get(rule)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn path_mutes(&self, path: &str, path_type: MutePathType) -> EventSet {
        self.lock()
            .tables
            .muted_paths
            .get(&(path.to_string(), path_type))
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn muting_inverted(&self, mute_type: InvertMutingType) -> bool {
        self.lock().tables.inverted.contains(&mute_type)
    }

    /// Highest number of control calls seen in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Operation names of every control request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<&'static str> {
        self.lock().requests.clone()
    }
}

fn event_set(ids: &[u32]) -> Result<EventSet, String> {
    decode_events(ids).map_err(|e| e.to_string())
}

impl std::fmt::Debug for LoopbackService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("LoopbackService")
            .field("connected", &state.binding.is_some())
            .field("sessions", &state.sessions)
            .field("subscriptions", &state.tables.subscriptions)
            .finish_non_exhaustive()
    }
}

struct LoopbackChannel {
    id: u64,
    service: Arc<LoopbackService>,
}

impl Channel for LoopbackChannel {
    fn call(&self, request: ServiceRequest, reply: ReplyFn<RemoteResult>) {
        let result = if self.service.is_current(self.id) {
            self.service.apply(request)
        } else {
            Err("connection invalid".to_string())
        };
        self.service.respond(Box::new(move || reply(result)));
    }

    fn send_custom_message(&self, data: Vec<u8>, reply: ReplyFn<Result<Vec<u8>, String>>) {
        if !self.service.is_current(self.id) {
            reply(Err("connection invalid".to_string()));
            return;
        }
        let responder = self.service.lock().custom_responder.clone();
        let result = match responder {
            Some(responder) => responder(data),
            None => Ok(data),
        };
        self.service.respond(Box::new(move || reply(result)));
    }

    fn invalidate(&self) {
        self.service.unbind(self.id);
    }
}
