use crate::controller::Controller;
use crate::error::{AmiError, ControlError};
use crate::query::{CommandArgs, QueryOutcome};
use amipal_core::control::{ControlMessage, ControlReply, ReplyStatus};
use amipal_core::{ActionCatalog, Event};
use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
pub use self::unix::{listen_unix, send_unix};

type Handler = Arc<dyn Fn(Controller, CommandArgs) -> BoxFuture<'static, Result<QueryOutcome, AmiError>> + Send + Sync>;

/// A control message plus an optional channel for its reply.
pub struct ControlRequest {
    pub message: ControlMessage,
    pub reply: Option<oneshot::Sender<ControlReply>>,
}

impl ControlRequest {
    pub fn new(message: ControlMessage) -> Self {
        Self {
            message,
            reply: None,
        }
    }

    pub fn with_reply(message: ControlMessage) -> (Self, oneshot::Receiver<ControlReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                reply: Some(tx),
            },
            rx,
        )
    }
}

/// Maps control command names to handlers and gates them by requester.
#[derive(Clone, Default)]
pub struct ControlRouter {
    handlers: HashMap<String, Handler>,
    allowed: HashSet<String>,
}

impl ControlRouter {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            handlers: HashMap::new(),
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// A handler for every catalogued action except `Login`, plus `Logoff`.
    pub fn with_catalog<I, S>(catalog: &ActionCatalog, allowed: I) -> Result<Self, ControlError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut router = Self::new(allowed);
        for spec in catalog.actions() {
            if spec.name == "Login" || spec.name == "Logoff" {
                continue;
            }
            let action = spec.name.clone();
            router.register(&spec.name, move |controller, args| {
                let action = action.clone();
                async move { controller.query(&action, args).await }
            })?;
        }
        router.register("Logoff", |controller, _args| async move {
            controller.logoff().await;
            Ok(QueryOutcome::default())
        })?;
        Ok(router)
    }

    pub fn allow(&mut self, requester_id: impl Into<String>) {
        self.allowed.insert(requester_id.into());
    }

    pub fn register<F, Fut>(&mut self, command: &str, handler: F) -> Result<(), ControlError>
    where
        F: Fn(Controller, CommandArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryOutcome, AmiError>> + Send + 'static,
    {
        let command = command.trim();
        if command.is_empty() {
            return Err(ControlError::EmptyCommand);
        }
        if self.handlers.contains_key(command) {
            return Err(ControlError::DuplicateCommand(command.to_string()));
        }
        let handler: Handler = Arc::new(
            move |controller: Controller, args: CommandArgs| -> BoxFuture<'static, Result<QueryOutcome, AmiError>> {
                Box::pin(handler(controller, args))
            },
        );
        self.handlers.insert(command.to_string(), handler);
        Ok(())
    }

    pub fn commands(&self) -> Vec<&str> {
        let mut names = self.handlers.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, controller: &Controller, message: ControlMessage) -> ControlReply {
        let command = message.command.trim().to_string();
        if !self.allowed.contains(&message.requester_id) {
            warn!(
                event = "ami_control_rejected",
                requester_id = %message.requester_id,
                command = %command,
                reason = "requester not allowed"
            );
            return ControlReply::rejected(&command, "requester not allowed");
        }
        let Some(handler) = self.handlers.get(&command).cloned() else {
            warn!(
                event = "ami_control_rejected",
                requester_id = %message.requester_id,
                command = %command,
                reason = "unknown command"
            );
            return ControlReply::rejected(&command, "unknown command");
        };

        debug!(event = "ami_control_dispatch", requester_id = %message.requester_id, command = %command);
        let args = CommandArgs {
            positional: message.args,
            keyword: message.kwargs.into_iter().collect(),
        };
        match handler(controller.clone(), args).await {
            Ok(outcome) => ControlReply {
                command,
                status: ReplyStatus::Ok,
                message: None,
                action_id: (!outcome.action_id.is_empty()).then_some(outcome.action_id),
                complete: outcome.complete,
                events: outcome.events.iter().map(Event::to_map).collect(),
            },
            Err(err) => {
                warn!(event = "ami_control_error", command = %command, error = %err);
                ControlReply::error(&command, err.to_string())
            }
        }
    }
}

pub(crate) struct ControlSource {
    router: Arc<ControlRouter>,
    requests: Mutex<mpsc::Receiver<ControlRequest>>,
}

impl ControlSource {
    pub(crate) fn new(router: ControlRouter, requests: mpsc::Receiver<ControlRequest>) -> Self {
        Self {
            router: Arc::new(router),
            requests: Mutex::new(requests),
        }
    }
}

/// Dispatches control requests for the lifetime of one session. Each request
/// runs on its own task so a `Logoff` can stop this loop.
pub(crate) async fn control_loop(
    controller: Controller,
    source: Arc<ControlSource>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut requests = source.requests.lock().await;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    info!(event = "ami_control_source_closed");
                    break;
                };
                let router = source.router.clone();
                let controller = controller.clone();
                tokio::spawn(async move {
                    let reply = router.dispatch(&controller, request.message).await;
                    if let Some(tx) = request.reply {
                        let _ = tx.send(reply);
                    }
                });
            }
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::ControlRequest;
    use crate::error::ControlError;
    use amipal_core::control::{
        decode_frame, encode_frame, ControlDecoder, ControlMessage, ControlReply, DecodeReport,
        DEFAULT_MAX_FRAME_BYTES,
    };
    use std::fs;
    use std::io;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::unix::OwnedWriteHalf;
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::{mpsc, watch};
    use tracing::{debug, info, warn};

    /// Accepts NDJSON control messages on a Unix socket and forwards them to
    /// `requests`, writing each reply back on the same connection.
    pub async fn listen_unix(
        path: &Path,
        requests: mpsc::Sender<ControlRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            let _ = fs::remove_file(path);
        }

        let listener = UnixListener::bind(path)?;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        info!(event = "ami_control_listen", socket = %path.display());

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, _addr)) => {
                            let requests = requests.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, requests).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "ami_control_accept_error", error = %err);
                        }
                    }
                }
            }
        }

        let _ = fs::remove_file(path);
        info!(event = "ami_control_stop", socket = %path.display());
        Ok(())
    }

    async fn handle_connection(stream: UnixStream, requests: mpsc::Sender<ControlRequest>) {
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = ControlDecoder::<ControlMessage>::default();
        let mut buf = vec![0u8; 4096];

        loop {
            let report = match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = answer(decoder.finish(), &requests, &mut writer).await;
                    break;
                }
                Ok(n) => decoder.push_chunk(&buf[..n]),
                Err(err) => {
                    warn!(event = "ami_control_read_error", error = %err);
                    break;
                }
            };
            if !answer(report, &requests, &mut writer).await {
                break;
            }
        }
        debug!(event = "ami_control_disconnect", lines = decoder.lines_seen());
    }

    /// Lines that could not be decoded are answered with a rejection naming
    /// the line, ahead of the requests decoded from the same read.
    async fn answer(
        report: DecodeReport<ControlMessage>,
        requests: &mpsc::Sender<ControlRequest>,
        writer: &mut OwnedWriteHalf,
    ) -> bool {
        for err in report.errors {
            warn!(event = "ami_control_decode_error", error = %err);
            if !write_reply(writer, &ControlReply::rejected("", err.to_string())).await {
                return false;
            }
        }
        for message in report.frames {
            let command = message.command.clone();
            let (request, reply_rx) = ControlRequest::with_reply(message);
            if requests.send(request).await.is_err() {
                debug!(event = "ami_control_queue_closed");
                return false;
            }
            let reply = reply_rx
                .await
                .unwrap_or_else(|_| ControlReply::error(&command, "request dropped"));
            if !write_reply(writer, &reply).await {
                return false;
            }
        }
        true
    }

    async fn write_reply(writer: &mut OwnedWriteHalf, reply: &ControlReply) -> bool {
        let frame = match encode_frame(reply, DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "ami_control_encode_error", command = %reply.command, error = %err);
                match encode_frame(
                    &ControlReply::error(&reply.command, err.to_string()),
                    DEFAULT_MAX_FRAME_BYTES,
                ) {
                    Ok(frame) => frame,
                    Err(_) => return true,
                }
            }
        };
        writer.write_all(&frame).await.is_ok() && writer.flush().await.is_ok()
    }

    /// Sends one message to a control socket and waits for its reply.
    pub async fn send_unix(
        path: &Path,
        message: &ControlMessage,
        timeout: Duration,
    ) -> Result<ControlReply, ControlError> {
        let exchange = async {
            let stream = UnixStream::connect(path).await?;
            let (reader, mut writer) = stream.into_split();
            let frame = encode_frame(message, DEFAULT_MAX_FRAME_BYTES)?;
            writer.write_all(&frame).await?;
            writer.flush().await?;

            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Err(ControlError::Closed);
            }
            Ok::<_, ControlError>(decode_frame::<ControlReply>(&line, DEFAULT_MAX_FRAME_BYTES)?)
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::fake_ami::FakeAmi;
    use crate::controller::{SessionEnd, SessionState};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn message(requester: &str, command: &str) -> ControlMessage {
        ControlMessage {
            requester_id: requester.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    #[test]
    fn registration_rejects_empty_and_duplicate_names() {
        let mut router = ControlRouter::new(["ops"]);
        router
            .register("Ping", |controller, _| async move { controller.ping().await })
            .expect("first registration");
        assert!(matches!(
            router.register("Ping", |controller, _| async move { controller.ping().await }),
            Err(ControlError::DuplicateCommand(_))
        ));
        assert!(matches!(
            router.register("  ", |controller, _| async move { controller.ping().await }),
            Err(ControlError::EmptyCommand)
        ));
        assert_eq!(router.commands(), vec!["Ping"]);
    }

    #[test]
    fn catalog_router_skips_login_and_adds_logoff() {
        let router = ControlRouter::with_catalog(&ActionCatalog::default(), ["ops"]).expect("router");
        let commands = router.commands();
        assert!(commands.contains(&"SIPpeers"));
        assert!(commands.contains(&"Logoff"));
        assert!(!commands.contains(&"Login"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_requesters_and_commands_are_rejected() {
        let controller = Controller::new(ControllerConfig::default());
        let router = ControlRouter::with_catalog(controller.catalog(), ["ops"]).expect("router");

        let reply = router.dispatch(&controller, message("intruder", "Ping")).await;
        assert_eq!(reply.status, ReplyStatus::Rejected);
        let reply = router.dispatch(&controller, message("ops", "Reboot")).await;
        assert_eq!(reply.status, ReplyStatus::Rejected);
        let reply = router.dispatch(&controller, message("ops", "Ping")).await;
        assert_eq!(reply.status, ReplyStatus::Error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn control_channel_drives_the_session() {
        let ami = FakeAmi::start().await;
        let (tx, rx) = mpsc::channel(8);
        let controller = Controller::builder(ami.config())
            .control(ControlRouter::with_catalog(&ActionCatalog::default(), ["ops"]).expect("router"), rx)
            .build();
        controller.login().await.expect("login");

        let (request, reply) = ControlRequest::with_reply(message("ops", "Ping"));
        tx.send(request).await.expect("send ping");
        let reply = tokio::time::timeout(Duration::from_secs(3), reply)
            .await
            .expect("reply timeout")
            .expect("reply");
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert!(reply.complete);
        assert_eq!(reply.events[0].get("Ping").map(String::as_str), Some("Pong"));

        let (request, reply) = ControlRequest::with_reply(message("ops", "Logoff"));
        tx.send(request).await.expect("send logoff");
        let reply = tokio::time::timeout(Duration::from_secs(3), reply)
            .await
            .expect("reply timeout")
            .expect("reply");
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(controller.state(), SessionState::Disconnected);
        assert_eq!(controller.session_end(), Some(SessionEnd::Logoff));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unix_listener_round_trips_a_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("control").join("amipal.sock");
        let (tx, mut rx) = mpsc::channel::<ControlRequest>(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener_path = path.clone();
        let handle = tokio::spawn(async move { listen_unix(&listener_path, tx, shutdown_rx).await });

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let mut reply = ControlReply::rejected(&request.message.command, "test");
                reply.message = Some(request.message.requester_id.clone());
                if let Some(tx) = request.reply {
                    let _ = tx.send(reply);
                }
            }
        });

        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let reply = send_unix(&path, &message("ops", "Ping"), Duration::from_secs(3))
            .await
            .expect("reply");
        assert_eq!(reply.command, "Ping");
        assert_eq!(reply.message.as_deref(), Some("ops"));

        let reply = send_unix(&path, &message("ops", " "), Duration::from_secs(3))
            .await
            .expect("rejection");
        assert_eq!(reply.status, ReplyStatus::Rejected);
        let reason = reply.message.expect("reason");
        assert!(reason.contains("line 1"), "{reason}");
        assert!(reason.contains("command is blank"), "{reason}");

        let _ = shutdown_tx.send(true);
        let result = handle.await.expect("join listener");
        assert!(result.is_ok(), "listener returned error: {result:?}");
        assert!(!path.exists());
    }
}
