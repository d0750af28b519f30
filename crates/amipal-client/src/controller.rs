use crate::config::ControllerConfig;
use crate::control::{self, ControlRequest, ControlRouter, ControlSource};
use crate::error::{AmiError, ArgumentError};
use crate::sink::{Direction, TracingSink, TrafficSink};
use crate::socket;
use amipal_core::event::{ACTION_ID_ATTR, RESPONSE_ATTR};
use amipal_core::line::LINE_TERMINATOR;
use amipal_core::registry::Classification;
use amipal_core::{ActionCatalog, BatchClock, BatchId, Event, EventRegistry, StreamFramer};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{broadcast, mpsc, watch, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How the last session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Logoff,
    LoginRejected,
    PeerClosed,
    ReadFailed,
    WriterStopped,
}

#[derive(Debug, Clone, Default)]
pub struct WaitOutcome {
    pub events: Vec<Event>,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub action_id: String,
    pub action: String,
    pub queued_at: DateTime<Utc>,
}

struct Session {
    state: SessionState,
    generation: u64,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    ended: Option<SessionEnd>,
}

struct Inner {
    config: ControllerConfig,
    catalog: Arc<ActionCatalog>,
    registry: RwLock<EventRegistry>,
    session: Mutex<Session>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    events: broadcast::Sender<Event>,
    sink: Arc<dyn TrafficSink>,
    control: Option<Arc<ControlSource>>,
    transition: tokio::sync::Mutex<()>,
}

/// Owns one manager session and the registry it feeds. Clones share it.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

pub struct ControllerBuilder {
    config: ControllerConfig,
    catalog: Option<Arc<ActionCatalog>>,
    sink: Option<Arc<dyn TrafficSink>>,
    control: Option<(ControlRouter, mpsc::Receiver<ControlRequest>)>,
}

impl ControllerBuilder {
    pub fn catalog(mut self, catalog: Arc<ActionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TrafficSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn control(mut self, router: ControlRouter, requests: mpsc::Receiver<ControlRequest>) -> Self {
        self.control = Some((router, requests));
        self
    }

    pub fn build(self) -> Controller {
        let catalog = self.catalog.unwrap_or_else(|| Arc::new(ActionCatalog::default()));
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let inner = Inner {
            registry: RwLock::new(EventRegistry::new(catalog.clone())),
            catalog,
            session: Mutex::new(Session {
                state: SessionState::Disconnected,
                generation: 0,
                outbound: None,
                shutdown: None,
                tasks: Vec::new(),
                ended: None,
            }),
            pending: Mutex::new(HashMap::new()),
            events,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            control: self
                .control
                .map(|(router, requests)| Arc::new(ControlSource::new(router, requests))),
            transition: tokio::sync::Mutex::new(()),
            config: self.config,
        };
        Controller {
            inner: Arc::new(inner),
        }
    }
}

impl Controller {
    pub fn builder(config: ControllerConfig) -> ControllerBuilder {
        ControllerBuilder {
            config,
            catalog: None,
            sink: None,
            control: None,
        }
    }

    pub fn new(config: ControllerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.inner.catalog
    }

    pub fn state(&self) -> SessionState {
        self.inner.session().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// `None` until a session has ended; cleared again by the next `login`.
    pub fn session_end(&self) -> Option<SessionEnd> {
        self.inner.session().ended
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub async fn registry(&self) -> RwLockReadGuard<'_, EventRegistry> {
        self.inner.registry.read().await
    }

    pub fn pending(&self) -> Vec<PendingRequest> {
        let mut pending = self.inner.pending().values().cloned().collect::<Vec<_>>();
        pending.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        pending
    }

    pub async fn sweep(&self, max_age: Duration) -> usize {
        self.inner.sweep(max_age).await
    }

    /// An existing session is logged off first. A `Response: Error` to the
    /// login tears the new session down again.
    pub async fn login(&self) -> Result<(), AmiError> {
        let _transition = self.inner.transition.lock().await;
        if self.state() == SessionState::Disconnected {
            self.teardown().await;
        } else {
            self.logoff_locked().await;
        }

        let config = &self.inner.config;
        self.inner.session().state = SessionState::Connecting;
        let stream = match socket::connect(&config.host, config.port, config.connect_timeout).await {
            Ok(stream) => stream,
            Err(err) => {
                self.inner.session().state = SessionState::Disconnected;
                warn!(event = "ami_connect_error", address = %config.address(), error = %err);
                return Err(err.into());
            }
        };
        info!(event = "ami_connected", host = %config.host, port = config.port);

        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let clock = BatchClock::after(self.inner.registry.read().await.last_batch());

        let generation = {
            let mut session = self.inner.session();
            session.generation += 1;
            session.state = SessionState::Connected;
            session.outbound = Some(outbound_tx);
            session.shutdown = Some(shutdown_tx);
            session.ended = None;
            session.generation
        };

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(read_loop(
            self.inner.clone(),
            reader,
            clock,
            shutdown_rx.clone(),
            generation,
        )));
        let inner = self.inner.clone();
        let write_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            socket::writer_loop(
                writer,
                outbound_rx,
                write_shutdown,
                inner.config.write_timeout,
                inner.sink.clone(),
            )
            .await;
            inner.close_session(generation, SessionEnd::WriterStopped);
        }));
        if let Some(source) = self.inner.control.clone() {
            tasks.push(tokio::spawn(control::control_loop(
                self.clone(),
                source,
                shutdown_rx.clone(),
            )));
        }
        if let Some(sweeper) = spawn_retention_sweeper(self.inner.clone(), shutdown_rx) {
            tasks.push(sweeper);
        }
        self.inner.session().tasks.extend(tasks);

        let action_id = self
            .cmd(
                "Login",
                &[
                    ("Username", config.username.as_str()),
                    ("Secret", config.secret.as_str()),
                ],
            )
            .await?;
        let outcome = self
            .wait_for(&action_id, None, config.wait_budget, config.wait_poll)
            .await;
        let response = outcome.events.iter().find(|event| event.is_response());
        match response {
            Some(event) if is_error_response(event) => {
                let message = event.get("Message").unwrap_or("authentication failed").to_string();
                warn!(event = "ami_login_rejected", username = %config.username, message = %message);
                self.inner.mark_ended(SessionEnd::LoginRejected);
                self.teardown().await;
                Err(AmiError::LoginRejected(message))
            }
            Some(_) => {
                info!(event = "ami_logged_in", username = %config.username);
                Ok(())
            }
            None => {
                warn!(event = "ami_login_unconfirmed", username = %config.username);
                Ok(())
            }
        }
    }

    /// Pending requests are abandoned. A no-op on a closed session.
    pub async fn logoff(&self) {
        let _transition = self.inner.transition.lock().await;
        self.logoff_locked().await;
    }

    async fn logoff_locked(&self) {
        if self.is_connected() {
            // The peer closes right after its Goodbye.
            self.inner.mark_ended(SessionEnd::Logoff);
            match self.cmd("Logoff", &[]).await {
                Ok(action_id) => {
                    let config = &self.inner.config;
                    self.wait_for(&action_id, None, config.wait_budget, config.wait_poll)
                        .await;
                }
                Err(err) => debug!(event = "ami_logoff_send_error", error = %err),
            }
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        let tasks = {
            let mut session = self.inner.session();
            session.state = SessionState::Disconnected;
            session.outbound = None;
            if let Some(shutdown) = session.shutdown.take() {
                let _ = shutdown.send(true);
            }
            std::mem::take(&mut session.tasks)
        };
        let stopped = tasks.len();
        for task in tasks {
            let _ = task.await;
        }
        let abandoned = {
            let mut pending = self.inner.pending();
            let count = pending.len();
            pending.clear();
            count
        };
        if stopped > 0 {
            info!(event = "ami_session_closed", abandoned);
        }
    }

    pub async fn cmd(&self, action: &str, args: &[(&str, &str)]) -> Result<String, AmiError> {
        let action_id = Uuid::now_v7().to_string();
        let frame = encode_command(action, &action_id, args)?;

        let outbound = {
            let session = self.inner.session();
            match (&session.state, &session.outbound) {
                (SessionState::Connected, Some(outbound)) => outbound.clone(),
                _ => return Err(AmiError::NotConnected),
            }
        };

        self.inner.pending().insert(
            action_id.clone(),
            PendingRequest {
                action_id: action_id.clone(),
                action: action.trim().to_string(),
                queued_at: Utc::now(),
            },
        );
        if outbound.send(frame).await.is_err() {
            self.inner.pending().remove(&action_id);
            return Err(AmiError::QueueClosed);
        }
        debug!(event = "ami_command_queued", action = %action.trim(), action_id = %action_id);
        Ok(action_id)
    }

    /// Completes on the first response header, or, with a sentinel, once the
    /// response and the sentinel event are both present. An error response
    /// completes regardless of the sentinel. When `budget` runs out the
    /// partial result comes back with `complete == false`.
    pub async fn wait_for(
        &self,
        action_id: &str,
        sentinel: Option<&str>,
        budget: Duration,
        poll: Duration,
    ) -> WaitOutcome {
        let deadline = Instant::now() + budget;
        let poll = poll.max(Duration::from_millis(1));
        loop {
            let outcome = self.collect(action_id, sentinel).await;
            let now = Instant::now();
            if outcome.complete || now >= deadline {
                if !outcome.complete {
                    debug!(
                        event = "ami_wait_timeout",
                        action_id = %action_id,
                        sentinel = sentinel.unwrap_or_default(),
                        partial = outcome.events.len()
                    );
                }
                self.inner.pending().remove(action_id);
                return outcome;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    async fn collect(&self, action_id: &str, sentinel: Option<&str>) -> WaitOutcome {
        let registry = self.inner.registry.read().await;
        let events = registry
            .by_action_id(action_id)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        drop(registry);

        let response = events.iter().find(|event| event.is_response());
        let complete = match (response, sentinel) {
            (None, _) => false,
            (Some(response), _) if is_error_response(response) => true,
            (Some(_), None) => true,
            (Some(_), Some(name)) => events.iter().any(|event| event.name() == Some(name)),
        };
        WaitOutcome { events, complete }
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_ended(&self, end: SessionEnd) {
        self.session().ended.get_or_insert(end);
    }

    // Task handles stay in place for the next logoff or login to join.
    fn close_session(&self, generation: u64, end: SessionEnd) {
        let mut session = self.session();
        if session.generation != generation || session.state == SessionState::Disconnected {
            return;
        }
        let end = *session.ended.get_or_insert(end);
        session.state = SessionState::Disconnected;
        session.outbound = None;
        if let Some(shutdown) = session.shutdown.take() {
            let _ = shutdown.send(true);
        }
        let abandoned = {
            let mut pending = self.pending();
            let count = pending.len();
            pending.clear();
            count
        };
        info!(event = "ami_session_lost", reason = ?end, abandoned);
    }

    async fn absorb(&self, framer: &mut StreamFramer, clock: &mut BatchClock, bytes: &[u8]) {
        socket::record_traffic(self.sink.as_ref(), Direction::Inbound, bytes);
        let report = match framer.feed(bytes) {
            Ok(report) => report,
            Err(err) => {
                debug!(event = "ami_feed_error", error = %err);
                return;
            }
        };
        for err in &report.rejected {
            warn!(event = "ami_frame_rejected", error = %err);
        }
        if report.events.is_empty() {
            return;
        }

        let batch = clock.next();
        let ingested = self.registry.write().await.ingest(report.events, batch);
        for event in ingested.events {
            if event.classification() == Some(Classification::Alien) {
                debug!(event = "ami_alien_event", name = event.name().unwrap_or_default());
            }
            let _ = self.events.send(event);
        }
    }

    async fn sweep(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };
        let removed = self
            .registry
            .write()
            .await
            .evict_older_than(BatchId::at(cutoff), None);
        if removed > 0 {
            debug!(event = "ami_retention_sweep", removed);
        }
        removed
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    mut reader: OwnedReadHalf,
    mut clock: BatchClock,
    mut shutdown: watch::Receiver<bool>,
    generation: u64,
) {
    let mut framer = StreamFramer::default();
    let mut buf = vec![0u8; inner.config.read_buffer.max(1)];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        inner.close_session(generation, SessionEnd::PeerClosed);
                        break;
                    }
                    Ok(n) => inner.absorb(&mut framer, &mut clock, &buf[..n]).await,
                    Err(err) => {
                        warn!(event = "ami_read_error", error = %err);
                        inner.close_session(generation, SessionEnd::ReadFailed);
                        break;
                    }
                }
            }
        }
    }
    let dropped = framer.reset();
    if dropped > 0 {
        debug!(event = "ami_tail_dropped", bytes = dropped);
    }
}

fn spawn_retention_sweeper(
    inner: Arc<Inner>,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let retention = inner.config.retention?;
    let tick = std::cmp::max(Duration::from_millis(100), retention / 2);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    inner.sweep(retention).await;
                }
            }
        }
    }))
}

fn is_error_response(event: &Event) -> bool {
    event
        .get(RESPONSE_ATTR)
        .map_or(false, |value| value.eq_ignore_ascii_case("error"))
}

pub fn encode_command(action: &str, action_id: &str, args: &[(&str, &str)]) -> Result<Vec<u8>, ArgumentError> {
    let action = action.trim();
    if action.is_empty() {
        return Err(ArgumentError::EmptyAction);
    }
    check_text("action", action)?;
    check_text(ACTION_ID_ATTR, action_id)?;

    let mut out = format!("Action: {action}{LINE_TERMINATOR}{ACTION_ID_ATTR}: {action_id}{LINE_TERMINATOR}");
    for (key, value) in args {
        check_text(key, key)?;
        if value.contains(['\r', '\n']) {
            return Err(ArgumentError::InvalidText {
                field: key.to_string(),
            });
        }
        out.push_str(&format!("{key}: {value}{LINE_TERMINATOR}"));
    }
    out.push_str(LINE_TERMINATOR);
    Ok(out.into_bytes())
}

fn check_text(field: &str, text: &str) -> Result<(), ArgumentError> {
    if text.trim().is_empty() || text.contains(['\r', '\n']) {
        return Err(ArgumentError::InvalidText {
            field: field.to_string(),
        });
    }
    Ok(())
}
