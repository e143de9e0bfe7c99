use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Capacity of each node connection's outbound queue.
    pub outbound_queue: usize,
    /// A node connection that stays silent this long is torn down.
    pub read_deadline: Duration,
    pub ping_interval: Duration,
    /// `host:port` pairs enrolled into the registry at startup.
    pub enrolled_nodes: Vec<(String, u16)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("EXILE_LISTEN_ADDR", "127.0.0.1:8081").parse()?;
        let log_level = env_or("EXILE_LOG_LEVEL", "info");
        let outbound_queue = env_parse("EXILE_OUTBOUND_QUEUE", 256usize)?;
        let read_deadline = Duration::from_secs(env_parse("EXILE_READ_DEADLINE_SECS", 60)?);
        let ping_interval = Duration::from_secs(env_parse("EXILE_PING_INTERVAL_SECS", 50)?);
        let enrolled_nodes = parse_enrolled(&env_or("EXILE_ENROLLED_NODES", ""))?;

        let config = Self {
            listen_addr,
            log_level,
            outbound_queue,
            read_deadline,
            ping_interval,
            enrolled_nodes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue == 0 {
            bail!("EXILE_OUTBOUND_QUEUE must be greater than zero");
        }
        if self.ping_interval >= self.read_deadline {
            bail!("EXILE_PING_INTERVAL_SECS must be shorter than EXILE_READ_DEADLINE_SECS");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            log_level: "info".to_string(),
            outbound_queue: 256,
            read_deadline: Duration::from_secs(60),
            ping_interval: Duration::from_secs(50),
            enrolled_nodes: Vec::new(),
        }
    }
}

fn parse_enrolled(raw: &str) -> Result<Vec<(String, u16)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let Some((host, port)) = entry.rsplit_once(':') else {
                bail!("invalid EXILE_ENROLLED_NODES entry {entry:?}: expected host:port");
            };
            let port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid port in {entry:?}: {e}"))?;
            Ok((host.to_string(), port))
        })
        .collect()
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        _ => Ok(default),
    }
}
