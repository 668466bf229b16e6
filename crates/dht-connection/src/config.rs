use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_CONNECTIONS: usize = 80;
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_GC_IDLE_THRESHOLD: Duration = Duration::from_secs(20);
pub const DEFAULT_RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_DUPLICATE_DETECTOR_CAPACITY: usize = 10_000;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, String> {
        if min > max {
            return Err(format!("invalid port range {min}-{max}"));
        }
        Ok(Self { min, max })
    }

    pub fn single(port: u16) -> Self {
        Self {
            min: port,
            max: port,
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    /// Accepts `"9000"` or `"9000-9010"`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|err| format!("invalid port '{part}': {err}"))
        };
        match value.split_once('-') {
            Some((min, max)) => PortRange::new(parse(min)?, parse(max)?),
            None => parse(value).map(PortRange::single),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WebsocketConnectorConfig {
    /// Host advertised in the local peer descriptor.
    pub host: String,
    pub bind_address: String,
    /// No server is started when unset.
    pub port_range: Option<PortRange>,
    pub tls: Option<TlsCertificate>,
    pub max_message_size: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for WebsocketConnectorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port_range: None,
            tls: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_millis(7_500),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebrtcConnectorConfig {
    pub ice_servers: Vec<IceServer>,
    pub port_range: Option<PortRange>,
    pub buffer_threshold_low: usize,
    pub buffer_threshold_high: usize,
    pub remote_description_timeout: Duration,
    pub rpc_request_timeout: Duration,
    pub allow_private_addresses: bool,
    /// Replaces the address of local host candidates when set.
    pub external_ip: Option<String>,
    pub max_message_size: usize,
}

impl Default for WebrtcConnectorConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVER)],
            port_range: None,
            buffer_threshold_low: 1 << 15,
            buffer_threshold_high: 1 << 17,
            remote_description_timeout: Duration::from_secs(15),
            rpc_request_timeout: Duration::from_secs(15),
            allow_private_addresses: true,
            external_ip: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    pub max_connections: usize,
    pub gc_interval: Duration,
    pub gc_idle_threshold: Duration,
    pub rpc_request_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub duplicate_detector_capacity: usize,
    pub websocket: WebsocketConnectorConfig,
    pub webrtc: WebrtcConnectorConfig,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            gc_interval: DEFAULT_GC_INTERVAL,
            gc_idle_threshold: DEFAULT_GC_IDLE_THRESHOLD,
            rpc_request_timeout: DEFAULT_RPC_REQUEST_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            duplicate_detector_capacity: DEFAULT_DUPLICATE_DETECTOR_CAPACITY,
            websocket: WebsocketConnectorConfig::default(),
            webrtc: WebrtcConnectorConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

impl ConnectionManagerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let tls = match (env::var("DHT_TLS_CERT"), env::var("DHT_TLS_KEY")) {
            (Ok(cert), Ok(key)) => Some(TlsCertificate {
                cert_path: cert.into(),
                key_path: key.into(),
            }),
            _ => None,
        };
        let websocket = WebsocketConnectorConfig {
            host: env::var("DHT_WEBSOCKET_HOST").unwrap_or(defaults.websocket.host),
            bind_address: env::var("DHT_WEBSOCKET_BIND").unwrap_or(defaults.websocket.bind_address),
            port_range: env_parse("DHT_WEBSOCKET_PORT_RANGE"),
            tls,
            max_message_size: env_parse("DHT_MAX_MESSAGE_SIZE")
                .unwrap_or(defaults.websocket.max_message_size),
            connect_timeout: env_millis("DHT_WEBSOCKET_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.websocket.connect_timeout),
            handshake_timeout: defaults.websocket.handshake_timeout,
        };

        let ice_servers = env::var("DHT_ICE_SERVERS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(IceServer::new)
                    .collect()
            })
            .unwrap_or(defaults.webrtc.ice_servers);
        let webrtc = WebrtcConnectorConfig {
            ice_servers,
            port_range: env_parse("DHT_WEBRTC_PORT_RANGE"),
            allow_private_addresses: env_flag("DHT_WEBRTC_ALLOW_PRIVATE")
                .unwrap_or(defaults.webrtc.allow_private_addresses),
            external_ip: env::var("DHT_EXTERNAL_IP").ok(),
            remote_description_timeout: env_millis("DHT_WEBRTC_NEGOTIATION_TIMEOUT_MS")
                .unwrap_or(defaults.webrtc.remote_description_timeout),
            ..defaults.webrtc
        };

        Self {
            max_connections: env_parse("DHT_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            gc_interval: env_millis("DHT_GC_INTERVAL_MS").unwrap_or(defaults.gc_interval),
            gc_idle_threshold: env_millis("DHT_GC_IDLE_THRESHOLD_MS")
                .unwrap_or(defaults.gc_idle_threshold),
            rpc_request_timeout: env_millis("DHT_RPC_TIMEOUT_MS")
                .unwrap_or(defaults.rpc_request_timeout),
            disconnect_timeout: defaults.disconnect_timeout,
            duplicate_detector_capacity: defaults.duplicate_detector_capacity,
            websocket,
            webrtc,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_gc_idle_threshold(mut self, threshold: Duration) -> Self {
        self.gc_idle_threshold = threshold;
        self
    }

    pub fn with_rpc_request_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_request_timeout = timeout;
        self
    }

    pub fn with_websocket(mut self, websocket: WebsocketConnectorConfig) -> Self {
        self.websocket = websocket;
        self
    }

    pub fn with_webrtc(mut self, webrtc: WebrtcConnectorConfig) -> Self {
        self.webrtc = webrtc;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: &[&str] = &[
        "DHT_MAX_CONNECTIONS",
        "DHT_GC_IDLE_THRESHOLD_MS",
        "DHT_WEBSOCKET_PORT_RANGE",
        "DHT_ICE_SERVERS",
        "DHT_TLS_CERT",
        "DHT_TLS_KEY",
        "DHT_WEBRTC_ALLOW_PRIVATE",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ConnectionManagerConfig::default();
        assert_eq!(config.max_connections, 80);
        assert_eq!(config.gc_interval, Duration::from_secs(5));
        assert_eq!(config.gc_idle_threshold, Duration::from_secs(20));
        assert_eq!(config.webrtc.buffer_threshold_high, 131_072);
        assert_eq!(config.webrtc.buffer_threshold_low, 32_768);
        assert_eq!(config.webrtc.ice_servers, vec![IceServer::new(DEFAULT_STUN_SERVER)]);
        assert!(config.websocket.port_range.is_none());
    }

    #[test]
    fn from_env_without_variables_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = ConnectionManagerConfig::from_env();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(config.websocket.tls.is_none());
        assert!(config.webrtc.allow_private_addresses);
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("DHT_MAX_CONNECTIONS", "12");
        env::set_var("DHT_GC_IDLE_THRESHOLD_MS", "1500");
        env::set_var("DHT_WEBSOCKET_PORT_RANGE", "9100-9110");
        env::set_var("DHT_ICE_SERVERS", "stun:a.example:3478, stun:b.example:3478");
        env::set_var("DHT_TLS_CERT", "/etc/dht/cert.pem");
        env::set_var("DHT_TLS_KEY", "/etc/dht/key.pem");
        env::set_var("DHT_WEBRTC_ALLOW_PRIVATE", "false");

        let config = ConnectionManagerConfig::from_env();
        clear_env();

        assert_eq!(config.max_connections, 12);
        assert_eq!(config.gc_idle_threshold, Duration::from_millis(1500));
        assert_eq!(config.websocket.port_range, Some(PortRange { min: 9100, max: 9110 }));
        assert_eq!(config.webrtc.ice_servers.len(), 2);
        assert_eq!(config.webrtc.ice_servers[1].url, "stun:b.example:3478");
        assert_eq!(
            config.websocket.tls.map(|tls| tls.key_path),
            Some(PathBuf::from("/etc/dht/key.pem"))
        );
        assert!(!config.webrtc.allow_private_addresses);
    }

    #[test]
    fn port_range_parsing() {
        assert_eq!("9000".parse::<PortRange>(), Ok(PortRange::single(9000)));
        assert_eq!("9000-9002".parse::<PortRange>(), Ok(PortRange { min: 9000, max: 9002 }));
        assert!("9002-9000".parse::<PortRange>().is_err());
        assert!("nope".parse::<PortRange>().is_err());
    }
}
