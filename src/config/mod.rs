use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProctorError, Result};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub api: ApiConfig,
    pub webrtc: WebRtcConfig,
    pub integrity: IntegrityConfig,
    pub reconnect: ReconnectConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub signaling_url: String,
}

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone)]
pub struct IntegrityConfig {
    pub tab_switch_limit: u32,
    pub warning_display: Duration,
    pub face_sample_interval: Duration,
    pub face_warning_cooldown: Duration,
    pub face_warning_threshold: u32,
    pub lockout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub store_path: PathBuf,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api/v1".to_string(),
            signaling_url: "ws://127.0.0.1:8080/signaling".to_string(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            tab_switch_limit: 3,
            warning_display: Duration::from_millis(3000),
            face_sample_interval: Duration::from_millis(1000),
            face_warning_cooldown: Duration::from_millis(3000),
            face_warning_threshold: 5,
            lockout: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./session-store.json"),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Config::default();

        let mut turn_servers = vec![];
        if let (Ok(turn_url), Ok(username), Ok(credential)) = (
            env::var("TURN_SERVER_URL"),
            env::var("TURN_USERNAME"),
            env::var("TURN_CREDENTIAL"),
        ) {
            turn_servers.push(TurnServer {
                urls: vec![turn_url],
                username,
                credential,
            });
        }

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            api: ApiConfig {
                base_url: env::var("API_BASE_URL").unwrap_or(defaults.api.base_url),
                signaling_url: env::var("SIGNALING_URL").unwrap_or(defaults.api.signaling_url),
            },
            webrtc: WebRtcConfig {
                stun_servers: env::var("STUN_SERVER_URL")
                    .map(|url| vec![url])
                    .unwrap_or(defaults.webrtc.stun_servers),
                turn_servers,
            },
            integrity: IntegrityConfig {
                tab_switch_limit: parse_var("TAB_SWITCH_LIMIT", defaults.integrity.tab_switch_limit)?,
                warning_display: parse_millis("WARNING_DISPLAY_MS", defaults.integrity.warning_display)?,
                face_sample_interval: parse_millis(
                    "FACE_SAMPLE_INTERVAL_MS",
                    defaults.integrity.face_sample_interval,
                )?,
                face_warning_cooldown: parse_millis(
                    "FACE_WARNING_COOLDOWN_MS",
                    defaults.integrity.face_warning_cooldown,
                )?,
                face_warning_threshold: parse_var(
                    "FACE_WARNING_THRESHOLD",
                    defaults.integrity.face_warning_threshold,
                )?,
                lockout: Duration::from_secs(
                    parse_var("LOCKOUT_MINUTES", defaults.integrity.lockout.as_secs() / 60)? * 60,
                ),
            },
            reconnect: ReconnectConfig {
                max_attempts: parse_var("RECONNECT_MAX_ATTEMPTS", defaults.reconnect.max_attempts)?,
                base_delay: parse_millis("RECONNECT_BASE_DELAY_MS", defaults.reconnect.base_delay)?,
                max_delay: parse_millis("RECONNECT_MAX_DELAY_MS", defaults.reconnect.max_delay)?,
            },
            session: SessionConfig {
                store_path: env::var("SESSION_STORE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.session.store_path),
                heartbeat_interval: Duration::from_secs(parse_var(
                    "HEARTBEAT_INTERVAL_SECS",
                    defaults.session.heartbeat_interval.as_secs(),
                )?),
            },
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ProctorError::InvalidConfiguration(format!("{key}={raw}"))),
        Err(_) => Ok(default),
    }
}

fn parse_millis(key: &str, default: Duration) -> Result<Duration> {
    let millis = parse_var(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_host(host: &str, port: u16) -> Config {
        Config {
            server: ServerConfig {
                host: host.to_string(),
                port,
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_parse_localhost() {
        let addr = config_with_host("localhost", 8080).bind_address();
        assert_eq!(addr, ([127, 0, 0, 1], 8080));
    }

    #[test]
    fn test_parse_ipv4_address() {
        let addr = config_with_host("192.168.1.1", 3000).bind_address();
        assert_eq!(addr, ([192, 168, 1, 1], 3000));
    }

    #[test]
    fn test_parse_empty_host() {
        let addr = config_with_host("", 8080).bind_address();
        assert_eq!(addr, ([0, 0, 0, 0], 8080));
    }

    #[test]
    fn test_parse_invalid_hostname_defaults_to_all() {
        let addr = config_with_host("invalid-hostname", 9000).bind_address();
        assert_eq!(addr, ([0, 0, 0, 0], 9000));
    }

    #[test]
    fn test_integrity_defaults() {
        let integrity = IntegrityConfig::default();
        assert_eq!(integrity.tab_switch_limit, 3);
        assert_eq!(integrity.face_sample_interval, Duration::from_secs(1));
        assert_eq!(integrity.lockout, Duration::from_secs(1800));
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        std::env::set_var("PROCTOR_TEST_BAD_PORT", "eighty");
        let parsed: Result<u16> = parse_var("PROCTOR_TEST_BAD_PORT", 8080);
        assert!(matches!(parsed, Err(ProctorError::InvalidConfiguration(_))));
        std::env::remove_var("PROCTOR_TEST_BAD_PORT");

        let fallback: u16 = parse_var("PROCTOR_TEST_UNSET_PORT", 8080).unwrap();
        assert_eq!(fallback, 8080);
    }
}
