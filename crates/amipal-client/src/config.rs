use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5038;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    /// Upper bound for a single socket read.
    pub read_buffer: usize,
    pub queue_capacity: usize,
    pub wait_budget: Duration,
    pub wait_poll: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Events older than this are swept from the registry. `None` keeps everything.
    pub retention: Option<Duration>,
    /// Broadcast buffer for event subscribers.
    pub event_capacity: usize,
}

impl ControllerConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            secret: secret.into(),
            ..Self::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: String::new(),
            secret: String::new(),
            read_buffer: 4096,
            queue_capacity: 256,
            wait_budget: Duration::from_secs(1),
            wait_poll: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            retention: None,
            event_capacity: 1024,
        }
    }
}
