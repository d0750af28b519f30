//! Loopback manager interface used by the session tests.

use crate::config::ControllerConfig;
use amipal_core::{Event, StreamFramer};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const GREETING: &str = "Asterisk Call Manager/5.0.1\r\n";

pub(crate) struct FakeAmi {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Event>>>,
    handle: JoinHandle<()>,
}

impl FakeAmi {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake ami");
        let addr = listener.local_addr().expect("local addr");
        let received = Arc::new(Mutex::new(Vec::new()));
        let shared = received.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });
        Self {
            addr,
            received,
            handle,
        }
    }

    pub(crate) fn config(&self) -> ControllerConfig {
        ControllerConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            username: "admin".to_string(),
            secret: "s3cret".to_string(),
            wait_budget: Duration::from_secs(2),
            wait_poll: Duration::from_millis(20),
            ..ControllerConfig::default()
        }
    }

    pub(crate) fn received(&self) -> Vec<Event> {
        self.received.lock().expect("received lock").clone()
    }

    pub(crate) fn received_actions(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|event| event.get("Action").map(str::to_string))
            .collect()
    }
}

impl Drop for FakeAmi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn message(pairs: &[(&str, &str)]) -> String {
    let mut out = pairs
        .iter()
        .map(|(key, value)| format!("{key}: {value}\r\n"))
        .collect::<String>();
    out.push_str("\r\n");
    out
}

async fn serve(mut stream: TcpStream, received: Arc<Mutex<Vec<Event>>>) {
    if stream.write_all(GREETING.as_bytes()).await.is_err() {
        return;
    }
    let mut framer = StreamFramer::default();
    let mut buf = vec![0u8; 1024];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let Ok(report) = framer.feed(&buf[..n]) else {
            continue;
        };
        for request in report.events {
            received.lock().expect("received lock").push(request.clone());
            let action = request.get("Action").unwrap_or_default().to_string();
            let id = request.action_id().unwrap_or_default().to_string();
            let keep_open = respond(&mut stream, &action, &id, &request).await;
            if !keep_open {
                let _ = stream.shutdown().await;
                return;
            }
        }
    }
}

async fn respond(stream: &mut TcpStream, action: &str, id: &str, request: &Event) -> bool {
    let success = |extra: &[(&str, &str)]| {
        let mut pairs = vec![("Response", "Success"), ("ActionID", id)];
        pairs.extend_from_slice(extra);
        message(&pairs)
    };

    let reply = match action {
        "Login" if request.get("Secret") == Some("wrong") => message(&[
            ("Response", "Error"),
            ("ActionID", id),
            ("Message", "Authentication failed"),
        ]),
        "Login" => {
            let mut out = success(&[("Message", "Authentication accepted")]);
            out.push_str(&message(&[
                ("Event", "FullyBooted"),
                ("Privilege", "system,all"),
                ("Status", "Fully Booted"),
            ]));
            out
        }
        "Ping" => {
            let mut out = message(&[("Event", "ZzzCustom"), ("Foo", "bar")]);
            out.push_str(&success(&[("Ping", "Pong"), ("Timestamp", "1700000000.000000")]));
            out
        }
        "SIPpeers" => {
            let mut out = success(&[("EventList", "start"), ("Message", "Peer status list will follow")]);
            for peer in ["100", "200"] {
                out.push_str(&message(&[
                    ("Event", "PeerEntry"),
                    ("ActionID", id),
                    ("ObjectName", peer),
                    ("Status", "OK (5 ms)"),
                ]));
            }
            out.push_str(&message(&[
                ("Event", "PeerlistComplete"),
                ("ActionID", id),
                ("EventList", "Complete"),
                ("ListItems", "2"),
            ]));
            let split = out.find("ObjectName: 200").unwrap_or(out.len() / 2);
            if stream.write_all(out[..split].as_bytes()).await.is_err() {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            return stream.write_all(out[split..].as_bytes()).await.is_ok();
        }
        "SIPshowregistry" => {
            let mut out = success(&[("EventList", "start")]);
            out.push_str(&message(&[
                ("Event", "RegistryEntry"),
                ("ActionID", id),
                ("Host", "sip.example.net"),
                ("State", "Registered"),
            ]));
            out
        }
        "ShowDialPlan" => {
            let mut out = success(&[("EventList", "start")]);
            for (context, exten) in [("from-internal", "100"), ("default", "s"), ("from-internal", "200")] {
                out.push_str(&message(&[
                    ("Event", "ListDialplan"),
                    ("ActionID", id),
                    ("Context", context),
                    ("Extension", exten),
                    ("Priority", "1"),
                ]));
            }
            out.push_str(&message(&[
                ("Event", "ShowDialPlanComplete"),
                ("ActionID", id),
                ("EventList", "Complete"),
                ("ListItems", "3"),
            ]));
            out
        }
        "Hangup" if request.has_attr("Channel") => success(&[("Message", "Channel Hungup")]),
        "Silence" => return true,
        "Die" => return false,
        "Logoff" => {
            let out = message(&[
                ("Response", "Goodbye"),
                ("ActionID", id),
                ("Message", "Thanks for all the fish."),
            ]);
            let _ = stream.write_all(out.as_bytes()).await;
            return false;
        }
        _ => message(&[
            ("Response", "Error"),
            ("ActionID", id),
            ("Message", "Invalid/unknown command"),
        ]),
    };
    stream.write_all(reply.as_bytes()).await.is_ok()
}
