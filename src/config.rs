use std::str::FromStr;
use std::time::Duration;

/// Collector limits and the default per-query deadlines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Queries allowed to run at once.
    pub max_in_flight: usize,
    /// Admitted requests waiting for a free slot.
    pub queue_capacity: usize,
    /// How long `get_sync` waits for room in the admission queue.
    pub enqueue_timeout: Duration,

    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Overall budget for the extension handshake and piece collection.
    pub pieces_timeout: Duration,

    /// Check the peer's handshake (protocol string, info-hash echo).
    pub verify_handshake: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_in_flight: 10_000,
            queue_capacity: 5_000,
            enqueue_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(1),
            pieces_timeout: Duration::from_secs(20),
            verify_handshake: false,
        }
    }
}

impl Options {
    /// Reads `METAFETCH_*` variables, loading a `.env` file first if one exists.
    /// Precedence: process env > .env > code defaults.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_in_flight: env_parse("METAFETCH_MAX_IN_FLIGHT", d.max_in_flight),
            queue_capacity: env_parse("METAFETCH_QUEUE_CAPACITY", d.queue_capacity),
            enqueue_timeout: env_secs("METAFETCH_ENQUEUE_TIMEOUT_SECS", d.enqueue_timeout),
            dial_timeout: env_secs("METAFETCH_DIAL_TIMEOUT_SECS", d.dial_timeout),
            read_timeout: env_millis("METAFETCH_READ_TIMEOUT_MS", d.read_timeout),
            write_timeout: env_millis("METAFETCH_WRITE_TIMEOUT_MS", d.write_timeout),
            pieces_timeout: env_secs("METAFETCH_PIECES_TIMEOUT_SECS", d.pieces_timeout),
            verify_handshake: env_flag("METAFETCH_VERIFY_HANDSHAKE", d.verify_handshake),
        }
        .normalized()
    }

    /// Channel capacities must be non-zero.
    pub fn normalized(mut self) -> Self {
        self.max_in_flight = self.max_in_flight.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self
    }
}

/// Trimmed value of `name`; unset and blank are the same.
fn env_value(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

// Unparseable values fall back to the default.
fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env_value(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs()))
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(name, default.as_millis() as u64))
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_value(name).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "on" | "yes") => true,
        Some("0" | "false" | "off" | "no") => false,
        _ => default,
    }
}
