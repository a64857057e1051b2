//! Server configuration, loaded from the environment with defaults.

use std::path::PathBuf;
use std::str::FromStr;

use crate::server::poller::MAX_EVENTS;

#[derive(Clone, Debug)]
pub struct Config {
    /// Listen port; 0 binds an ephemeral port.
    pub port: u16,
    /// Bit 0: edge-triggered client events. Bit 1: edge-triggered accepts.
    pub trig_mode: u8,
    /// Idle-connection timeout in milliseconds; 0 disables the timer.
    pub timeout_ms: u64,
    /// SO_LINGER on the listen socket for graceful close.
    pub opt_linger: bool,
    /// Root directory of the static content.
    pub src_dir: PathBuf,
    pub sql_host: String,
    pub sql_port: u16,
    pub sql_user: String,
    pub sql_pwd: String,
    pub db_name: String,
    /// Database connections held by the pool; 0 disables authentication.
    pub conn_pool_size: usize,
    /// Worker threads processing requests off the reactor.
    pub thread_count: usize,
    pub open_log: bool,
    /// 0 = debug, 1 = info, 2 = warn, 3 = error.
    pub log_level: u8,
    /// Buffered lines in the async log sink before it drops.
    pub log_queue_size: usize,
    /// Capacity of the multiplexer's ready-event array.
    pub max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1316,
            trig_mode: 3,
            timeout_ms: 60000,
            opt_linger: false,
            src_dir: PathBuf::from("./resources"),
            sql_host: "localhost".to_string(),
            sql_port: 3306,
            sql_user: "root".to_string(),
            sql_pwd: "root".to_string(),
            db_name: "citadel".to_string(),
            conn_pool_size: 12,
            thread_count: 6,
            open_log: true,
            log_level: 1,
            log_queue_size: 1024,
            max_events: MAX_EVENTS,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            port: env_or("PORT", defaults.port),
            trig_mode: env_or("TRIG_MODE", defaults.trig_mode),
            timeout_ms: env_or("TIMEOUT_MS", defaults.timeout_ms),
            opt_linger: env_or("OPT_LINGER", defaults.opt_linger),
            src_dir: env_or("SRC_DIR", defaults.src_dir),
            sql_host: env_or("SQL_HOST", defaults.sql_host),
            sql_port: env_or("SQL_PORT", defaults.sql_port),
            sql_user: env_or("SQL_USER", defaults.sql_user),
            sql_pwd: env_or("SQL_PWD", defaults.sql_pwd),
            db_name: env_or("DB_NAME", defaults.db_name),
            conn_pool_size: env_or("CONN_POOL_SIZE", defaults.conn_pool_size),
            thread_count: env_or("THREAD_COUNT", defaults.thread_count),
            open_log: env_or("OPEN_LOG", defaults.open_log),
            log_level: env_or("LOG_LEVEL", defaults.log_level),
            log_queue_size: env_or("LOG_QUEUE_SIZE", defaults.log_queue_size),
            max_events: env_or("MAX_EVENTS", defaults.max_events),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
