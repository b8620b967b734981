//! Delivery coordinator.
//!
//! The coordinator is the public face of the engine. Every piece of mutable
//! bookkeeping lives in a single actor task: pending body buffers, waiters,
//! ephemeral bindings, the destination cache and the session registry. Public
//! methods send a command and await a `oneshot` reply; transfer tasks report
//! back over a second channel.
//!
//! ```text
//!  send / send_passive / send_ephemeral          transfer tasks
//!            │                                        │
//!            ▼                                        ▼
//!     ┌─────────────┐   commands    ┌───────┐   session events
//!     │ Coordinator │──────────────▶│ Actor │◀──────────────────
//!     └─────────────┘               └───────┘
//!                                       │ spawn
//!                                       ▼
//!                           ┌──────────────────────┐
//!                           │ handler invocations  │
//!                           └──────────────────────┘
//! ```

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use ferry_core::{
    ClientEvent, ClientEventKind, ClientEventLog, Clock, CorrelationRecord, Destination,
    DestinationId, DestinationRegistry, HandlerId, JournalEntry, LifetimeExtender,
    NoOpClientEventLog, NoOpLifetimeExtender, NoOpNotificationSink, NotificationSink, RealClock,
    Request, SessionId, StaticDestinationRegistry, TransferId, TransferKey, JOURNAL_VERSION,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient, DeliveryRequest},
    codec::{self, EncodedBody, EncodingTarget, ResponseBody, ResponseCodec},
    correlation,
    error::{DeliveryError, Result},
    handler::{HandlerRegistry, ResponseHandler},
    lifecycle::GroupWaiter,
    session::{
        SessionConfig, SessionEvent, SessionKind, SessionRegistry, DURABLE_SESSION_PREFIX,
    },
    storage::{mock::MemoryTransferJournal, LoadedEntry, TransferJournal},
    transfer::{self, TransferContext},
};

/// Decides whether correlated sends skip the immediate attempt.
///
/// Hosts typically answer `true` while running in the background, where an
/// immediate request is likely to be suspended mid-flight.
pub trait DurableEligibility: Send + Sync {
    /// Whether to go straight to the durable session.
    fn durable_immediately(&self) -> bool;
}

impl<F> DurableEligibility for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn durable_immediately(&self) -> bool {
        self()
    }
}

/// Configuration for the delivery coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Session naming, resource timeout and retry policy.
    pub session: SessionConfig,
    /// HTTP client configuration.
    pub client: ClientConfig,
    /// Maximum time to wait for in-flight handler invocations on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            client: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        }
    }
}

/// An outstanding transfer as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    /// Session and transfer id.
    pub key: TransferKey,
    /// Transport kind of the owning session.
    pub kind: SessionKind,
    /// Correlation blob, absent for ephemeral transfers.
    pub correlation: Option<String>,
}

enum Command {
    SendEphemeral {
        destination: Destination,
        request: Request,
        url: Option<String>,
        reply: oneshot::Sender<Result<ResponseBody>>,
    },
    Submit(Submission),
    BackgroundWake {
        session_id: SessionId,
        entries: Vec<LoadedEntry>,
        completion: Box<dyn FnOnce() + Send>,
        reply: oneshot::Sender<()>,
    },
    Restore {
        session_id: SessionId,
        entries: Vec<LoadedEntry>,
        reply: oneshot::Sender<usize>,
    },
    Outstanding {
        reply: oneshot::Sender<Vec<TransferSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Submission {
    handler_id: HandlerId,
    destination: Destination,
    request: Request,
    kind: SessionKind,
    mode: SubmitMode,
    reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Clone, Copy)]
enum SubmitMode {
    /// Resolve once the response is handled. With `fallback`, transport
    /// failures are returned without invoking the handler so the caller can
    /// retry on the durable session.
    Await { fallback: bool },
    /// Resolve once the transfer is journaled.
    Passive,
}

struct EphemeralWaiter {
    destination: Destination,
    reply: oneshot::Sender<Result<ResponseBody>>,
}

struct HandledWaiter {
    reply: oneshot::Sender<Result<()>>,
    fallback: bool,
}

/// Handle to the delivery engine. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    journal: Arc<dyn TransferJournal>,
    lifetime: Arc<dyn LifetimeExtender>,
    eligibility: Arc<dyn DurableEligibility>,
    durable_session_id: SessionId,
    shutdown_timeout: Duration,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DeliveryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryCoordinator")
            .field("durable_session_id", &self.inner.durable_session_id)
            .finish_non_exhaustive()
    }
}

impl DeliveryCoordinator {
    /// Starts building a coordinator.
    pub fn builder(config: CoordinatorConfig) -> DeliveryCoordinatorBuilder {
        DeliveryCoordinatorBuilder::new(config)
    }

    /// Identifier of this process's durable session.
    pub fn durable_session_id(&self) -> &SessionId {
        &self.inner.durable_session_id
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.inner.commands.send(command(reply)).map_err(|_| DeliveryError::ShutdownRequested)?;
        response.await.map_err(|_| DeliveryError::ShutdownRequested)
    }

    /// Sends a request on the immediate session and returns the decoded
    /// response. Nothing is persisted and no handler is involved.
    ///
    /// # Errors
    ///
    /// Returns transport, status and envelope errors as they occur.
    pub async fn send_ephemeral(
        &self,
        destination: &Destination,
        request: Request,
    ) -> Result<ResponseBody> {
        let _lifetime = self.inner.lifetime.begin("webhook ephemeral request");

        self.call(|reply| Command::SendEphemeral {
            destination: destination.clone(),
            request,
            url: None,
            reply,
        })
        .await?
    }

    /// Like [`send_ephemeral`](Self::send_ephemeral), deserializing the
    /// response into `T`.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedResponse` if the body does not have the shape of
    /// `T`.
    pub async fn send_ephemeral_as<T: DeserializeOwned>(
        &self,
        destination: &Destination,
        request: Request,
    ) -> Result<T> {
        self.send_ephemeral(destination, request).await?.parse()
    }

    /// Sends a correlated request and waits until its response has been
    /// handled.
    ///
    /// Outstanding transfers for the same handler and destination may be
    /// replaced first. Unless the durable eligibility policy says otherwise,
    /// the immediate session is tried first and the durable session is used
    /// only when that attempt fails at the transport level.
    ///
    /// # Errors
    ///
    /// Returns `UnregisteredHandler`, encoding errors, the decoded response
    /// error or the handler error. Returns `Replaced` if a later send
    /// superseded this one.
    pub async fn send(
        &self,
        handler_id: HandlerId,
        destination: &Destination,
        request: Request,
    ) -> Result<()> {
        let _lifetime = self.inner.lifetime.begin("webhook send");

        if self.inner.eligibility.durable_immediately() {
            return self
                .submit(handler_id, destination, request, SessionKind::Durable, SubmitMode::Await {
                    fallback: false,
                })
                .await;
        }

        let immediate = self
            .submit(
                handler_id.clone(),
                destination,
                request.clone(),
                SessionKind::Immediate,
                SubmitMode::Await { fallback: true },
            )
            .await;

        match immediate {
            Err(error) if error.is_retryable() => {
                debug!(
                    handler_id = %handler_id,
                    destination_id = %destination.id,
                    error = %error,
                    "immediate attempt failed, falling back to durable session"
                );
                self.submit(handler_id, destination, request, SessionKind::Durable, SubmitMode::Await {
                    fallback: false,
                })
                .await
            },
            other => other,
        }
    }

    /// Sends a correlated request on the durable session and returns once it
    /// is journaled. The response is handled in the background.
    ///
    /// # Errors
    ///
    /// Returns `UnregisteredHandler`, encoding errors, or `Storage` if the
    /// transfer could not be journaled.
    pub async fn send_passive(
        &self,
        handler_id: HandlerId,
        destination: &Destination,
        request: Request,
    ) -> Result<()> {
        let _lifetime = self.inner.lifetime.begin("webhook passive send");

        self.submit(handler_id, destination, request, SessionKind::Durable, SubmitMode::Passive)
            .await
    }

    async fn submit(
        &self,
        handler_id: HandlerId,
        destination: &Destination,
        request: Request,
        kind: SessionKind,
        mode: SubmitMode,
    ) -> Result<()> {
        self.call(|reply| {
            Command::Submit(Submission {
                handler_id,
                destination: destination.clone(),
                request,
                kind,
                mode,
                reply,
            })
        })
        .await?
    }

    /// Checks that a server answers at `base_url` with `destination`'s
    /// webhook, bypassing handlers.
    ///
    /// # Errors
    ///
    /// Returns the transport, status or envelope error of the round trip.
    pub async fn send_test(&self, destination: &Destination, base_url: &str) -> Result<()> {
        let _lifetime = self.inner.lifetime.begin("webhook connection test");

        self.call(|reply| Command::SendEphemeral {
            destination: destination.clone(),
            request: Request::new("get_config", json!({})),
            url: Some(destination.webhook_url_at(base_url)),
            reply,
        })
        .await?
        .map(|_| ())
    }

    /// Attaches a host completion to a durable session.
    ///
    /// `completion` runs exactly once, after the session's transfers have
    /// completed and their responses have been handled. Sessions from a
    /// previous process generation are restored from the journal first and
    /// dropped once they drain.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for identifiers that do not name a durable
    /// session, or `Storage` if the journal cannot be read.
    pub async fn handle_background_wake(
        &self,
        identifier: &str,
        completion: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        if !identifier.starts_with(DURABLE_SESSION_PREFIX) {
            return Err(DeliveryError::configuration(format!(
                "{identifier} is not a durable session identifier"
            )));
        }

        let session_id = SessionId::new(identifier);
        let entries = if session_id == self.inner.durable_session_id {
            Vec::new()
        } else {
            self.inner.journal.load_session(session_id.clone()).await?
        };

        self.call(|reply| Command::BackgroundWake {
            session_id,
            entries,
            completion: Box::new(completion),
            reply,
        })
        .await
    }

    /// Restarts the durable transfers journaled by a previous run of this
    /// process. Returns how many were restored.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the journal cannot be read.
    pub async fn resume(&self) -> Result<usize> {
        let session_id = self.inner.durable_session_id.clone();
        let entries = self.inner.journal.load_session(session_id.clone()).await?;

        let restored = self.call(|reply| Command::Restore { session_id, entries, reply }).await?;
        info!(restored, "resumed journaled transfers");
        Ok(restored)
    }

    /// Lists transfers that have not completed.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownRequested` after shutdown.
    pub async fn outstanding_transfers(&self) -> Result<Vec<TransferSnapshot>> {
        self.call(|reply| Command::Outstanding { reply }).await
    }

    /// Stops the coordinator.
    ///
    /// Pending waiters resolve with `ShutdownRequested`; durable transfers
    /// stay journaled for [`resume`](Self::resume). In-flight handler
    /// invocations are given up to the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownRequested` if already shut down.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down delivery coordinator");

        let (reply, done) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Shutdown { reply })
            .map_err(|_| DeliveryError::ShutdownRequested)?;

        if tokio::time::timeout(self.inner.shutdown_timeout, done).await.is_err() {
            warn!(
                timeout_ms = self.inner.shutdown_timeout.as_millis(),
                "shutdown timed out, abandoning in-flight handlers"
            );
            if let Some(actor) = self.inner.actor.lock().await.take() {
                actor.abort();
            }
            return Ok(());
        }

        if let Some(actor) = self.inner.actor.lock().await.take() {
            if let Err(e) = actor.await {
                error!(error = %e, "coordinator actor failed");
            }
        }
        info!("delivery coordinator stopped");
        Ok(())
    }
}

/// Builder for [`DeliveryCoordinator`].
///
/// Collaborators default to no-op implementations, the real clock and an
/// in-memory journal.
pub struct DeliveryCoordinatorBuilder {
    config: CoordinatorConfig,
    handlers: Option<HandlerRegistry>,
    destinations: Arc<dyn DestinationRegistry>,
    event_log: Arc<dyn ClientEventLog>,
    notifications: Arc<dyn NotificationSink>,
    lifetime: Arc<dyn LifetimeExtender>,
    journal: Arc<dyn TransferJournal>,
    clock: Arc<dyn Clock>,
    eligibility: Arc<dyn DurableEligibility>,
}

impl DeliveryCoordinatorBuilder {
    /// Creates a builder with default collaborators.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            handlers: None,
            destinations: Arc::new(StaticDestinationRegistry::new(Vec::new())),
            event_log: Arc::new(NoOpClientEventLog),
            notifications: Arc::new(NoOpNotificationSink),
            lifetime: Arc::new(NoOpLifetimeExtender),
            journal: Arc::new(MemoryTransferJournal::new()),
            clock: Arc::new(RealClock::new()),
            eligibility: Arc::new(|| false),
        }
    }

    /// Sets the handler table. Defaults to the built-in handlers.
    #[must_use]
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Sets the registry used to resolve destinations of restored transfers.
    #[must_use]
    pub fn destinations(mut self, destinations: Arc<dyn DestinationRegistry>) -> Self {
        self.destinations = destinations;
        self
    }

    /// Sets the client event log.
    #[must_use]
    pub fn event_log(mut self, event_log: Arc<dyn ClientEventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    /// Sets the notification sink.
    #[must_use]
    pub fn notifications(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    /// Sets the lifetime extender.
    #[must_use]
    pub fn lifetime_extender(mut self, lifetime: Arc<dyn LifetimeExtender>) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Sets the transfer journal.
    #[must_use]
    pub fn journal(mut self, journal: Arc<dyn TransferJournal>) -> Self {
        self.journal = journal;
        self
    }

    /// Sets the clock used for retry scheduling.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the durable eligibility policy.
    #[must_use]
    pub fn durable_eligibility(mut self, eligibility: impl DurableEligibility + 'static) -> Self {
        self.eligibility = Arc::new(eligibility);
        self
    }

    /// Uses a fixed durable eligibility answer.
    #[must_use]
    pub fn durable_immediately(self, durable: bool) -> Self {
        self.durable_eligibility(move || durable)
    }

    /// Builds the coordinator and spawns its actor on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built, or
    /// `DuplicateHandler` from the default handler table.
    pub fn build(self) -> Result<DeliveryCoordinator> {
        let client = DeliveryClient::new(self.config.client.clone())?;
        let handlers = match self.handlers {
            Some(handlers) => handlers,
            None => HandlerRegistry::builder().with_builtins().build()?,
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let session_config = self.config.session.clone();

        let actor = Actor {
            commands: commands_rx,
            events: events_rx,
            transfers: TransferContext {
                client,
                journal: self.journal.clone(),
                clock: self.clock.clone(),
                events: events_tx.clone(),
                shutdown: shutdown.clone(),
                retry_policy: session_config.retry_policy.clone(),
            },
            dispatcher: Dispatcher {
                codec: ResponseCodec::new(self.event_log.clone()),
                event_log: self.event_log,
                notifications: self.notifications,
                lifetime: self.lifetime.clone(),
                journal: self.journal.clone(),
                events: events_tx,
            },
            handlers,
            destinations: self.destinations,
            sessions: SessionRegistry::new(&session_config),
            resource_timeout: chrono::Duration::from_std(session_config.resource_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(2)),
            clock: self.clock,
            buffers: HashMap::new(),
            ephemeral: HashMap::new(),
            waiters: HashMap::new(),
            enqueued: HashMap::new(),
            destination_cache: HashMap::new(),
            invocations: JoinSet::new(),
            shutdown,
        };

        info!(
            durable_session_id = %session_config.durable_session_id(),
            "starting delivery coordinator"
        );
        let handle = tokio::spawn(actor.run());

        Ok(DeliveryCoordinator {
            inner: Arc::new(Inner {
                commands: commands_tx,
                journal: self.journal,
                lifetime: self.lifetime,
                eligibility: self.eligibility,
                durable_session_id: session_config.durable_session_id(),
                shutdown_timeout: self.config.shutdown_timeout,
                actor: Mutex::new(Some(handle)),
            }),
        })
    }
}

/// Shared dependencies of handler invocations.
#[derive(Clone)]
struct Dispatcher {
    codec: ResponseCodec,
    event_log: Arc<dyn ClientEventLog>,
    notifications: Arc<dyn NotificationSink>,
    lifetime: Arc<dyn LifetimeExtender>,
    journal: Arc<dyn TransferJournal>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

struct Invocation {
    key: TransferKey,
    record: CorrelationRecord,
    destination: Destination,
    handler: Box<dyn ResponseHandler>,
    outcome: Result<u16>,
    body: Vec<u8>,
    waiter: Option<HandledWaiter>,
    journaled: bool,
}

/// Reports the end of an invocation to the session's event group, even if
/// the handler panics.
struct InvocationGuard {
    events: mpsc::UnboundedSender<SessionEvent>,
    session_id: Option<SessionId>,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            let _ = self.events.send(SessionEvent::InvocationFinished { session_id });
        }
    }
}

impl Dispatcher {
    async fn invoke(self, invocation: Invocation) {
        let Invocation { key, record, destination, handler, outcome, body, waiter, journaled } =
            invocation;
        let _finished = InvocationGuard {
            events: self.events.clone(),
            session_id: Some(key.session_id.clone()),
        };
        let _lifetime = self.lifetime.begin("webhook response handling");

        let response = match outcome {
            Ok(status_code) => self.codec.decode(&destination, status_code, &body).await,
            Err(error) => Err(error),
        };

        let reported = matches!(&response, Err(e) if e.is_definitive_rejection());
        let handled = handler.handle(&record.request, &response).await;
        if let Ok(result) = &handled {
            if let Some(notification) = result.notification.clone() {
                self.event_log
                    .record(
                        ClientEvent::new(
                            ClientEventKind::Notification,
                            "Presenting notification from webhook response",
                        )
                        .with("handler_id", record.identifier.as_str())
                        .with("destination", destination.id.as_str()),
                    )
                    .await;
                self.notifications.deliver(notification).await;
            }
        }

        let joined = response.and(handled).map(|_| ());

        if journaled {
            if let Err(e) = self.journal.remove(key.transfer_id).await {
                warn!(transfer_id = %key.transfer_id, error = %e, "failed to remove journal entry");
            }
        }

        match waiter {
            Some(waiter) => {
                let _ = waiter.reply.send(joined);
            },
            None => match joined {
                Ok(()) => debug!(
                    transfer_id = %key.transfer_id,
                    handler_id = %record.identifier,
                    "handled background response"
                ),
                Err(e) => {
                    error!(
                        transfer_id = %key.transfer_id,
                        handler_id = %record.identifier,
                        destination_id = %destination.id,
                        error = %e,
                        "background webhook failed with no waiter"
                    );
                    if !reported {
                        self.event_log
                            .record(
                                e.client_event("Background webhook request failed")
                                    .with("handler_id", record.identifier.as_str())
                                    .with("destination", destination.id.as_str())
                                    .with("transfer_id", key.transfer_id.to_string()),
                            )
                            .await;
                    }
                },
            },
        }
    }
}

struct Actor {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    transfers: TransferContext,
    dispatcher: Dispatcher,
    handlers: HandlerRegistry,
    destinations: Arc<dyn DestinationRegistry>,
    sessions: SessionRegistry,
    resource_timeout: chrono::Duration,
    clock: Arc<dyn Clock>,
    buffers: HashMap<TransferKey, Vec<u8>>,
    ephemeral: HashMap<TransferKey, EphemeralWaiter>,
    waiters: HashMap<TransferKey, HandledWaiter>,
    enqueued: HashMap<TransferKey, oneshot::Sender<Result<()>>>,
    destination_cache: HashMap<DestinationId, Destination>,
    invocations: JoinSet<()>,
    shutdown: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.on_event(event),
                Some(result) = self.invocations.join_next(), if !self.invocations.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "response handling task failed");
                        let error = DeliveryError::internal(format!("response handling task failed: {e}"));
                        self.report(error.client_event("Webhook response handling aborted"));
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    },
                    Some(command) => self.on_command(command),
                    None => {
                        self.stop().await;
                        break;
                    },
                },
            }
        }
    }

    async fn stop(&mut self) {
        self.shutdown.cancel();

        for (_, waiter) in self.ephemeral.drain() {
            let _ = waiter.reply.send(Err(DeliveryError::ShutdownRequested));
        }
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.reply.send(Err(DeliveryError::ShutdownRequested));
        }
        for (_, reply) in self.enqueued.drain() {
            let _ = reply.send(Err(DeliveryError::ShutdownRequested));
        }

        while let Some(result) = self.invocations.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "response handling task failed during shutdown");
            }
        }
    }

    /// Records a diagnostic event without blocking the actor.
    fn report(&mut self, event: ClientEvent) {
        let event_log = self.dispatcher.event_log.clone();
        self.invocations.spawn(async move { event_log.record(event).await });
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendEphemeral { destination, request, url, reply } => {
                self.start_ephemeral(destination, &request, url, reply);
            },
            Command::Submit(submission) => self.submit(submission),
            Command::BackgroundWake { session_id, entries, completion, reply } => {
                self.background_wake(&session_id, entries, completion);
                let _ = reply.send(());
            },
            Command::Restore { session_id, entries, reply } => {
                let restored = self.restore(&session_id, entries);
                let _ = reply.send(restored);
            },
            Command::Outstanding { reply } => {
                let _ = reply.send(self.snapshot());
            },
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            },
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::DataReceived { key, chunk } => {
                self.buffers.entry(key).or_default().extend_from_slice(&chunk);
            },
            SessionEvent::AttemptFailed { key, attempts, error } => {
                self.buffers.remove(&key);
                debug!(transfer_id = %key.transfer_id, attempts, error = %error, "attempt failed");
            },
            SessionEvent::Enqueued { key } => {
                debug!(session_id = %key.session_id, transfer_id = %key.transfer_id, "transfer enqueued");
                if let Some(reply) = self.enqueued.remove(&key) {
                    let _ = reply.send(Ok(()));
                }
            },
            SessionEvent::Completed { key, outcome } => self.on_completed(key, outcome),
            SessionEvent::InvocationFinished { session_id } => {
                let released =
                    self.sessions.get_mut(&session_id).map(|s| s.group.leave()).unwrap_or_default();
                self.release(&session_id, released);
            },
        }
    }

    fn start_ephemeral(
        &mut self,
        destination: Destination,
        request: &Request,
        url: Option<String>,
        reply: oneshot::Sender<Result<ResponseBody>>,
    ) {
        let body = match codec::encode(request, &destination, EncodingTarget::Wire) {
            Ok(body) => body,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            },
        };

        let session_id = self.sessions.current(SessionKind::Immediate).clone();
        let key = TransferKey::new(session_id.clone(), TransferId::new());
        let cancel = self.shutdown.child_token();
        self.sessions.session_for(&session_id).track(key.transfer_id, None, cancel.clone());

        let request = DeliveryRequest {
            transfer: key.clone(),
            url: url.unwrap_or_else(|| destination.webhook_url()),
            body: body.bytes,
            attempt_number: 1,
            verify_tls: destination.verify_tls,
        };
        debug!(
            transfer_id = %key.transfer_id,
            destination_id = %destination.id,
            "starting ephemeral transfer"
        );

        self.ephemeral.insert(key, EphemeralWaiter { destination, reply });
        tokio::spawn(transfer::run_immediate(self.transfers.clone(), request, cancel));
    }

    fn prepare(
        &self,
        handler_id: &HandlerId,
        destination: &Destination,
        request: &Request,
    ) -> Result<(String, EncodedBody)> {
        if !self.handlers.contains(handler_id) {
            return Err(DeliveryError::unregistered_handler(handler_id.as_str()));
        }

        let record = CorrelationRecord {
            server: destination.id.clone(),
            request: request.clone(),
            identifier: handler_id.clone(),
        };
        let correlation = correlation::encode(&record)?;
        let body = codec::encode(request, destination, EncodingTarget::Wire)?;

        Ok((correlation, body))
    }

    fn submit(&mut self, submission: Submission) {
        let Submission { handler_id, destination, request, kind, mode, reply } = submission;

        let (correlation, body) = match self.prepare(&handler_id, &destination, &request) {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            },
        };

        self.replace_outstanding(&handler_id, &destination, &request);
        self.destination_cache.insert(destination.id.clone(), destination.clone());

        let session_id = self.sessions.current(kind).clone();
        let key = TransferKey::new(session_id.clone(), TransferId::new());
        let cancel = self.shutdown.child_token();
        {
            let session = self.sessions.session_for(&session_id);
            session.track(key.transfer_id, Some(correlation.clone()), cancel.clone());
            session.latch.reset();
        }

        match mode {
            SubmitMode::Await { fallback } => {
                self.waiters.insert(key.clone(), HandledWaiter { reply, fallback });
            },
            SubmitMode::Passive => {
                self.enqueued.insert(key.clone(), reply);
            },
        }

        info!(
            session_id = %session_id,
            transfer_id = %key.transfer_id,
            handler_id = %handler_id,
            destination_id = %destination.id,
            request_type = %request.kind,
            "starting correlated transfer"
        );

        match kind {
            SessionKind::Immediate => {
                let request = DeliveryRequest {
                    transfer: key,
                    url: destination.webhook_url(),
                    body: body.bytes,
                    attempt_number: 1,
                    verify_tls: destination.verify_tls,
                };
                tokio::spawn(transfer::run_immediate(self.transfers.clone(), request, cancel));
            },
            SessionKind::Durable => {
                let now = self.clock.now();
                let entry = JournalEntry {
                    version: JOURNAL_VERSION,
                    transfer_id: key.transfer_id,
                    session_id,
                    correlation,
                    url: destination.webhook_url(),
                    body: body.bytes.to_vec(),
                    attempts: 0,
                    created_at: now,
                    next_attempt_at: now,
                    expires_at: now + self.resource_timeout,
                };
                tokio::spawn(transfer::run_durable(
                    self.transfers.clone(),
                    entry,
                    destination.verify_tls,
                    true,
                    cancel,
                ));
            },
        }
    }

    /// Cancels outstanding transfers superseded by a new request, and durable
    /// transfers whose correlation can no longer be read.
    fn replace_outstanding(
        &mut self,
        handler_id: &HandlerId,
        destination: &Destination,
        request: &Request,
    ) {
        let handler = self.handlers.instantiate(handler_id, destination).ok();
        let mut doomed = Vec::new();
        let mut orphans = Vec::new();

        for kind in [SessionKind::Immediate, SessionKind::Durable] {
            let session_id = self.sessions.current(kind).clone();
            let Some(session) = self.sessions.get(&session_id) else {
                continue;
            };

            for (transfer_id, blob) in session.tasks() {
                let Some(blob) = blob else {
                    continue;
                };

                match correlation::decode(blob) {
                    Err(e) if kind == SessionKind::Durable => {
                        warn!(transfer_id = %transfer_id, error = %e, "cancelling orphaned transfer");
                        orphans.push(
                            e.client_event("Cancelled webhook transfer with unreadable correlation")
                                .with("transfer_id", transfer_id.to_string()),
                        );
                        doomed.push((session_id.clone(), transfer_id, DeliveryError::Cancelled));
                    },
                    Err(_) => {},
                    Ok(record) => {
                        if record.identifier != *handler_id || record.server != destination.id {
                            continue;
                        }
                        if handler.as_ref().is_some_and(|h| h.should_replace(&record.request, request)) {
                            doomed.push((session_id.clone(), transfer_id, DeliveryError::Replaced));
                        }
                    },
                }
            }
        }

        for (session_id, transfer_id, reason) in doomed {
            self.cancel_transfer(&session_id, transfer_id, reason);
        }
        for event in orphans {
            self.report(event);
        }
    }

    fn cancel_transfer(&mut self, session_id: &SessionId, transfer_id: TransferId, reason: DeliveryError) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if !session.cancel(transfer_id) {
            return;
        }
        let kind = session.kind();

        info!(session_id = %session_id, transfer_id = %transfer_id, reason = %reason, "cancelled transfer");

        let key = TransferKey::new(session_id.clone(), transfer_id);
        if let Some(waiter) = self.waiters.remove(&key) {
            let _ = waiter.reply.send(Err(reason.clone()));
        }
        if let Some(reply) = self.enqueued.remove(&key) {
            let _ = reply.send(Err(reason));
        }
        if kind == SessionKind::Durable {
            self.remove_journal_entry(transfer_id);
        }
    }

    fn remove_journal_entry(&self, transfer_id: TransferId) {
        let journal = self.dispatcher.journal.clone();
        tokio::spawn(async move {
            if let Err(e) = journal.remove(transfer_id).await {
                warn!(transfer_id = %transfer_id, error = %e, "failed to remove journal entry");
            }
        });
    }

    fn on_completed(&mut self, key: TransferKey, outcome: Result<u16>) {
        let body = self.buffers.remove(&key).unwrap_or_default();
        let Some(session) = self.sessions.get_mut(&key.session_id) else {
            warn!(session_id = %key.session_id, "completion for unknown session");
            return;
        };
        let kind = session.kind();
        let transfer = session.finish(key.transfer_id);
        let cancelled = transfer.as_ref().is_some_and(|t| t.is_cancelled())
            || matches!(outcome, Err(DeliveryError::Cancelled));
        let blob = transfer.and_then(|t| t.correlation);

        if let Some(waiter) = self.ephemeral.remove(&key) {
            let codec = self.dispatcher.codec.clone();
            self.invocations.spawn(async move {
                let result = match outcome {
                    _ if cancelled => Err(DeliveryError::Cancelled),
                    Ok(status_code) => codec.decode(&waiter.destination, status_code, &body).await,
                    Err(e) => Err(e),
                };
                let _ = waiter.reply.send(result);
            });
        } else if cancelled {
            debug!(transfer_id = %key.transfer_id, "ignoring completion of cancelled transfer");
            if let Some(waiter) = self.waiters.remove(&key) {
                let _ = waiter.reply.send(Err(DeliveryError::Cancelled));
            }
            if kind == SessionKind::Durable {
                self.remove_journal_entry(key.transfer_id);
            }
        } else {
            self.dispatch(key.clone(), kind, blob, outcome, body);
        }

        self.check_finished(&key.session_id);
    }

    fn dispatch(
        &mut self,
        key: TransferKey,
        kind: SessionKind,
        blob: Option<String>,
        outcome: Result<u16>,
        body: Vec<u8>,
    ) {
        let journaled = kind == SessionKind::Durable;

        if let Some(reply) = self.enqueued.remove(&key) {
            // Completed before it was journaled, so nothing was sent.
            let _ = reply.send(outcome.map(|_| ()));
            return;
        }

        let waiter = self.waiters.remove(&key);
        if let Err(error) = &outcome {
            let unsent = matches!(error, DeliveryError::Storage { .. });
            let falls_back = waiter.as_ref().is_some_and(|w| w.fallback) && error.is_retryable();
            if unsent || falls_back {
                if let Some(waiter) = waiter {
                    let _ = waiter.reply.send(Err(error.clone()));
                }
                return;
            }
        }

        let resolved = blob
            .as_deref()
            .ok_or_else(|| DeliveryError::correlation_decode("transfer has no correlation"))
            .and_then(correlation::decode)
            .and_then(|record| {
                let destination = self
                    .resolve_destination(&record.server)
                    .ok_or_else(|| DeliveryError::destination_not_found(record.server.as_str()))?;
                let handler = self.handlers.instantiate(&record.identifier, &destination)?;
                Ok((record, destination, handler))
            });

        let (record, destination, handler) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(
                    session_id = %key.session_id,
                    transfer_id = %key.transfer_id,
                    error = %e,
                    "dropping completion that cannot be dispatched"
                );
                self.report(
                    e.client_event("Dropped webhook response that cannot be dispatched")
                        .with("transfer_id", key.transfer_id.to_string()),
                );
                if let Some(waiter) = waiter {
                    let _ = waiter.reply.send(Err(e));
                }
                if journaled {
                    self.remove_journal_entry(key.transfer_id);
                }
                return;
            },
        };

        if let Some(session) = self.sessions.get_mut(&key.session_id) {
            session.group.enter();
        }

        debug!(
            transfer_id = %key.transfer_id,
            handler_id = %record.identifier,
            destination_id = %destination.id,
            "dispatching response to handler"
        );
        let dispatcher = self.dispatcher.clone();
        self.invocations.spawn(dispatcher.invoke(Invocation {
            key,
            record,
            destination,
            handler,
            outcome,
            body,
            waiter,
            journaled,
        }));
    }

    fn resolve_destination(&self, id: &DestinationId) -> Option<Destination> {
        self.destination_cache.get(id).cloned().or_else(|| self.destinations.resolve(id))
    }

    /// Delivers the "all events delivered" signal once a durable session has
    /// no transfers left.
    fn check_finished(&mut self, session_id: &SessionId) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if session.kind() != SessionKind::Durable || session.active() > 0 {
            return;
        }

        if session.latch.fire().is_some() {
            let released = session.group.leave();
            self.release(session_id, released);
        }
    }

    fn release(&mut self, session_id: &SessionId, waiters: Vec<GroupWaiter>) {
        for waiter in waiters {
            match waiter {
                GroupWaiter::Completion(completion) => {
                    info!(session_id = %session_id, "background events handled");
                    completion();
                },
                GroupWaiter::RemoveSession => {
                    if !self.sessions.is_current(session_id) {
                        self.sessions.remove(session_id);
                    }
                },
            }
        }
    }

    fn background_wake(
        &mut self,
        session_id: &SessionId,
        entries: Vec<LoadedEntry>,
        completion: Box<dyn FnOnce() + Send>,
    ) {
        info!(session_id = %session_id, restoring = entries.len(), "handling background wake");
        if !entries.is_empty() {
            self.restore(session_id, entries);
        }

        let current = self.sessions.is_current(session_id);
        let session = self.sessions.session_for(session_id);
        let mut released = Vec::new();

        session.group.enter();
        for () in session.latch.set(()) {
            released.extend(session.group.leave());
        }
        released.extend(session.group.notify(GroupWaiter::Completion(completion)));
        if !current {
            released.extend(session.group.notify(GroupWaiter::RemoveSession));
        }
        let idle = session.active() == 0;

        self.release(session_id, released);
        if idle {
            self.check_finished(session_id);
        }
    }

    fn restore(&mut self, session_id: &SessionId, entries: Vec<LoadedEntry>) -> usize {
        let mut restored = 0;

        for loaded in entries {
            let entry = match loaded {
                Ok(entry) => entry,
                Err((transfer_id, e)) => {
                    warn!(transfer_id = %transfer_id, error = %e, "discarding unreadable journal entry");
                    self.remove_journal_entry(transfer_id);
                    continue;
                },
            };

            if self.sessions.get(session_id).is_some_and(|s| s.contains(entry.transfer_id)) {
                continue;
            }

            let verify_tls = correlation::decode(&entry.correlation)
                .ok()
                .and_then(|record| self.resolve_destination(&record.server))
                .map_or(true, |destination| destination.verify_tls);

            let cancel = self.shutdown.child_token();
            let session = self.sessions.session_for(session_id);
            session.track(entry.transfer_id, Some(entry.correlation.clone()), cancel.clone());
            session.latch.reset();

            debug!(
                session_id = %session_id,
                transfer_id = %entry.transfer_id,
                attempts = entry.attempts,
                "restoring journaled transfer"
            );
            tokio::spawn(transfer::run_durable(
                self.transfers.clone(),
                entry,
                verify_tls,
                false,
                cancel,
            ));
            restored += 1;
        }

        restored
    }

    fn snapshot(&self) -> Vec<TransferSnapshot> {
        self.sessions
            .iter()
            .flat_map(|session| {
                session.tasks().map(move |(transfer_id, correlation)| TransferSnapshot {
                    key: TransferKey::new(session.id().clone(), transfer_id),
                    kind: session.kind(),
                    correlation: correlation.map(str::to_owned),
                })
            })
            .collect()
    }
}
