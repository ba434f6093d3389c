//! Client configuration from environment variables.

use std::time::Duration;

/// Where the hosted backend lives and how to authenticate against it.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Project base URL, e.g. `https://abc.supabase.co`.
    pub base_url: String,
    /// Public (anon) API key sent with every request.
    pub anon_key: String,
    /// User access token (JWT). Without one the client runs as anon.
    pub access_token: Option<String>,
    /// Storage bucket used for message attachments.
    pub attachment_bucket: String,
}

impl BackendConfig {
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.base_url.trim_end_matches('/'))
    }

    pub fn storage_url(&self) -> String {
        format!("{}/storage/v1", self.base_url.trim_end_matches('/'))
    }

    /// Websocket endpoint of the realtime service.
    pub fn realtime_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn={}",
            ws_base,
            urlencoding::encode(&self.anon_key),
            bidroom_shared::PROTOCOL_VSN
        )
    }
}

/// Change-feed connection timings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Pause between tearing a connection down and opening the next one.
    pub reconnect_delay: Duration,
    /// How often the health check runs.
    pub health_check_interval: Duration,
    /// Silence after which a READY connection is treated as a zombie.
    pub stale_after: Duration,
    /// Shorter silence threshold applied when the host becomes visible again.
    pub visibility_stale_after: Duration,
    /// Upper bound on a single connect + join handshake.
    pub handshake_timeout: Duration,
    /// Socket heartbeat period (socket transports only).
    pub heartbeat_interval: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(300),
            health_check_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(60),
            visibility_stale_after: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageConfig {
    /// Fixed page size for history fetches.
    pub page_size: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Dedup set capacity; trimmed to the most recent half once exceeded.
    pub dedup_capacity: usize,
    /// Characters of message text shown in a toast.
    pub preview_chars: usize,
    /// Characters of message text shown in a native notification body.
    pub native_body_chars: usize,
    /// Window title without the unread prefix.
    pub base_title: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 100,
            preview_chars: 80,
            native_body_chars: 120,
            base_title: "Bidroom".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// Input silence after which the local user is reported as stopped.
    pub idle_timeout: Duration,
    /// Silence after which a remote typer is dropped from the roster.
    pub remote_expiry: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(2000),
            remote_expiry: Duration::from_millis(5000),
        }
    }
}

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    pub feed: FeedConfig,
    pub messages: MessageConfig,
    pub notifications: NotificationConfig,
    pub typing: TypingConfig,
    pub log_filter: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                base_url: "http://localhost:54321".to_string(),
                anon_key: String::new(),
                access_token: None,
                attachment_bucket: "message-attachments".to_string(),
            },
            feed: FeedConfig::default(),
            messages: MessageConfig::default(),
            notifications: NotificationConfig::default(),
            typing: TypingConfig::default(),
            log_filter: crate::logging::DEFAULT_FILTER.to_string(),
        }
    }
}

impl ClientConfig {
    /// Build configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BIDROOM_BACKEND_URL`: backend base URL (default: "http://localhost:54321")
    /// - `BIDROOM_ANON_KEY`: public API key (default: empty)
    /// - `BIDROOM_ACCESS_TOKEN`: user JWT (default: unset)
    /// - `BIDROOM_ATTACHMENT_BUCKET`: storage bucket (default: "message-attachments")
    /// - `BIDROOM_PAGE_SIZE`: history page size (default: 50)
    /// - `BIDROOM_RECONNECT_DELAY_MS`: reconnect delay (default: 300)
    /// - `BIDROOM_HEALTH_INTERVAL_MS`: health check period (default: 15000)
    /// - `BIDROOM_STALE_AFTER_MS`: zombie threshold (default: 60000)
    /// - `BIDROOM_VISIBILITY_STALE_AFTER_MS`: foreground threshold (default: 30000)
    /// - `BIDROOM_HANDSHAKE_TIMEOUT_MS`: connect + join bound (default: 10000)
    /// - `BIDROOM_HEARTBEAT_INTERVAL_MS`: socket heartbeat (default: 25000)
    /// - `BIDROOM_TYPING_IDLE_MS`: local typing idle window (default: 2000)
    /// - `BIDROOM_TYPING_EXPIRY_MS`: remote typing expiry (default: 5000)
    /// - `BIDROOM_DEDUP_CAPACITY`: notification dedup capacity (default: 100)
    /// - `BIDROOM_TITLE`: base window title (default: "Bidroom")
    /// - `BIDROOM_LOG`: default log filter when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let backend = BackendConfig {
            base_url: env_string("BIDROOM_BACKEND_URL", &defaults.backend.base_url),
            anon_key: env_string("BIDROOM_ANON_KEY", &defaults.backend.anon_key),
            access_token: std::env::var("BIDROOM_ACCESS_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            attachment_bucket: env_string(
                "BIDROOM_ATTACHMENT_BUCKET",
                &defaults.backend.attachment_bucket,
            ),
        };

        let feed = FeedConfig {
            reconnect_delay: env_millis("BIDROOM_RECONNECT_DELAY_MS", defaults.feed.reconnect_delay),
            health_check_interval: env_millis(
                "BIDROOM_HEALTH_INTERVAL_MS",
                defaults.feed.health_check_interval,
            ),
            stale_after: env_millis("BIDROOM_STALE_AFTER_MS", defaults.feed.stale_after),
            visibility_stale_after: env_millis(
                "BIDROOM_VISIBILITY_STALE_AFTER_MS",
                defaults.feed.visibility_stale_after,
            ),
            handshake_timeout: env_millis(
                "BIDROOM_HANDSHAKE_TIMEOUT_MS",
                defaults.feed.handshake_timeout,
            ),
            heartbeat_interval: env_millis(
                "BIDROOM_HEARTBEAT_INTERVAL_MS",
                defaults.feed.heartbeat_interval,
            ),
        };

        Self {
            backend,
            feed,
            messages: MessageConfig {
                page_size: env_parse("BIDROOM_PAGE_SIZE", defaults.messages.page_size).max(1),
            },
            notifications: NotificationConfig {
                dedup_capacity: env_parse(
                    "BIDROOM_DEDUP_CAPACITY",
                    defaults.notifications.dedup_capacity,
                )
                .max(2),
                base_title: env_string("BIDROOM_TITLE", &defaults.notifications.base_title),
                ..defaults.notifications
            },
            typing: TypingConfig {
                idle_timeout: env_millis("BIDROOM_TYPING_IDLE_MS", defaults.typing.idle_timeout),
                remote_expiry: env_millis("BIDROOM_TYPING_EXPIRY_MS", defaults.typing.remote_expiry),
            },
            log_filter: env_string("BIDROOM_LOG", &defaults.log_filter),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
