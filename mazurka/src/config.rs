//! Server configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listening TCP port, restricted to the user range [1024, 65535].
    pub port: u16,

    /// 0 LT/LT, 1 LT-listen ET-conn, 2 ET-listen LT-conn, 3 ET/ET.
    pub trig_mode: u8,

    /// Idle connection timeout in milliseconds; 0 disables reaping.
    pub timeout_ms: u64,

    /// `SO_LINGER` with `l_onoff=1, l_linger=1` when set.
    pub opt_linger: bool,

    pub sql_host: String,
    pub sql_port: u16,
    pub sql_user: String,
    pub sql_pwd: String,
    pub db_name: String,

    /// Database handles opened at startup.
    pub conn_pool_num: usize,

    /// Worker threads; 0 selects the hardware concurrency.
    pub thread_num: usize,

    pub open_log: bool,
    /// 0 debug, 1 info, 2 warn, 3 error.
    pub log_level: u8,
    /// Async log queue capacity; 0 writes synchronously.
    pub log_queue_size: usize,
    pub log_dir: PathBuf,

    /// Static asset root; defaults to `<cwd>/../resources`.
    pub src_dir: Option<PathBuf>,
}

impl Config {
    /// Read configuration from the environment, with `.env` support.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config = Config {
            port: var_or("PORT", 9006)?,
            trig_mode: var_or("TRIG_MODE", 3)?,
            timeout_ms: var_or("TIMEOUT_MS", 60_000)?,
            opt_linger: var_or("OPT_LINGER", false)?,
            sql_host: var_or_string("SQL_HOST", "127.0.0.1"),
            sql_port: var_or("SQL_PORT", 3306)?,
            sql_user: var_or_string("SQL_USER", "root"),
            sql_pwd: var_or_string("SQL_PWD", "root"),
            db_name: var_or_string("DB_NAME", "webdb"),
            conn_pool_num: var_or("CONN_POOL_NUM", 8)?,
            thread_num: var_or("THREAD_NUM", 0)?,
            open_log: var_or("OPEN_LOG", true)?,
            log_level: var_or("LOG_LEVEL", 1)?,
            log_queue_size: var_or("LOG_QUEUE_SIZE", 1024)?,
            log_dir: PathBuf::from(var_or_string("LOG_DIR", "./log")),
            src_dir: env::var("SRC_DIR").ok().map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port < 1024 {
            return Err(ServerError::Config(format!(
                "port {} outside the user range [1024, 65535]",
                self.port
            )));
        }
        if self.trig_mode > 3 {
            return Err(ServerError::Config(format!(
                "trig_mode {} not in 0..=3",
                self.trig_mode
            )));
        }
        if self.conn_pool_num == 0 {
            return Err(ServerError::Config(
                "conn_pool_num must be at least 1".into(),
            ));
        }
        if self.log_level > 3 {
            return Err(ServerError::Config(format!(
                "log_level {} not in 0..=3",
                self.log_level
            )));
        }
        Ok(())
    }

    /// The static asset root: the configured directory, or `../resources`
    /// relative to the working directory.
    pub fn resolved_src_dir(&self) -> PathBuf {
        match &self.src_dir {
            Some(dir) => dir.clone(),
            None => env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("../resources"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 9006,
            trig_mode: 3,
            timeout_ms: 60_000,
            opt_linger: false,
            sql_host: "127.0.0.1".into(),
            sql_port: 3306,
            sql_user: "root".into(),
            sql_pwd: "root".into(),
            db_name: "webdb".into(),
            conn_pool_num: 8,
            thread_num: 0,
            open_log: true,
            log_level: 1,
            log_queue_size: 1024,
            log_dir: PathBuf::from("./log"),
            src_dir: None,
        }
    }
}

fn var_or_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|err| ServerError::Config(format!("{}={:?}: {}", name, raw, err))),
        Err(_) => Ok(default),
    }
}
