//! Environment-driven configuration.
//!
//! Settings come from `PROOFSYNC_*` variables. A `.env` in the game directory
//! is merged first; it never overrides variables that are already set.
//!
//! - `PROOFSYNC_SERVER_CMD`: server executable (default: resolved `lake`)
//! - `PROOFSYNC_SERVER_ARGS`: whitespace-separated args (default: `serve`)
//! - `PROOFSYNC_RPC_TIMEOUT_S`: per-call timeout (default: 30)
//! - `PROOFSYNC_KEEPALIVE_S`: RPC session keep-alive interval (default: 10)
//! - `PROOFSYNC_TRANSIENT_MARKERS`: `;`-separated failure texts treated as transient
//! - `PROOFSYNC_EMPTY_PAYLOAD`: `keep` | `reset`
//! - `PROOFSYNC_LOG`: tracing filter used when `RUST_LOG` is unset

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manager::{EmptyPayloadPolicy, ManagerOptions};
use crate::rpc::RpcOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`{key}` must be a non-negative integer, got `{value}`")]
    NotAnInteger { key: String, value: String },
    #[error("`{key}`: {msg}")]
    Invalid { key: String, msg: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the server runs in (the game's Lake project).
    pub game_dir: PathBuf,
    pub server_cmd: PathBuf,
    pub server_args: Vec<String>,
    pub rpc_timeout: Duration,
    pub keepalive: Duration,
    pub transient_markers: Vec<String>,
    pub empty_payload: EmptyPayloadPolicy,
    pub log_filter: String,
}

impl Config {
    pub fn defaults(game_dir: impl Into<PathBuf>) -> Self {
        Self {
            game_dir: game_dir.into(),
            server_cmd: resolve_lake(),
            server_args: vec!["serve".to_string()],
            rpc_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(10),
            transient_markers: RpcOptions::default().transient_markers,
            empty_payload: EmptyPayloadPolicy::default(),
            log_filter: "proofsync_core=info,proofsync=info".to_string(),
        }
    }

    /// Defaults overlaid with `.env` (in `game_dir`) and the process environment.
    pub fn from_env(game_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let game_dir = game_dir.into();
        load_dotenv_if_present(&game_dir);
        let mut cfg = Self::defaults(game_dir);

        if let Some(v) = env_nonempty("PROOFSYNC_SERVER_CMD") {
            cfg.server_cmd = PathBuf::from(v);
        }
        if let Some(v) = env_nonempty("PROOFSYNC_SERVER_ARGS") {
            cfg.server_args = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(s) = env_u64("PROOFSYNC_RPC_TIMEOUT_S")? {
            cfg.rpc_timeout = Duration::from_secs(s);
        }
        if let Some(s) = env_u64("PROOFSYNC_KEEPALIVE_S")? {
            cfg.keepalive = Duration::from_secs(s.max(1));
        }
        if let Some(v) = env_nonempty("PROOFSYNC_TRANSIENT_MARKERS") {
            cfg.transient_markers = v
                .split(';')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
        }
        if let Some(v) = env_nonempty("PROOFSYNC_EMPTY_PAYLOAD") {
            cfg.empty_payload = v.parse().map_err(|msg| ConfigError::Invalid {
                key: "PROOFSYNC_EMPTY_PAYLOAD".to_string(),
                msg,
            })?;
        }
        if let Some(v) = env_nonempty("PROOFSYNC_LOG") {
            cfg.log_filter = v;
        }
        Ok(cfg)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            rpc: RpcOptions {
                timeout: self.rpc_timeout,
                transient_markers: self.transient_markers.clone(),
            },
            empty_payload: self.empty_payload,
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    let Some(v) = env_nonempty(key) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::NotAnInteger {
            key: key.to_string(),
            value: v,
        })
}

/// Parse a `.env` file. Keys already present in the environment are skipped.
pub fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Ok(text) = std::fs::read_to_string(path) else {
        return out;
    };
    for raw in text.lines() {
        let mut line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("export ") {
            line = rest.trim_start();
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        let v = v.trim();
        let v = match v.as_bytes() {
            [q, .., last] if q == last && (*q == b'"' || *q == b'\'') => &v[1..v.len() - 1],
            _ => v,
        };
        if env_nonempty(k).is_none() {
            out.insert(k.to_string(), v.to_string());
        }
    }
    out
}

pub fn load_dotenv_if_present(dir: &Path) {
    for (k, v) in parse_dotenv(&dir.join(".env")) {
        std::env::set_var(k, v);
    }
}

/// `$LAKE`, then `~/.elan/bin/lake`, then `lake` on `PATH`.
pub fn resolve_lake() -> PathBuf {
    if let Some(lake) = env_nonempty("LAKE") {
        return PathBuf::from(lake);
    }
    if let Some(home) = dirs::home_dir() {
        let elan_lake = home.join(".elan").join("bin").join("lake");
        if elan_lake.exists() {
            return elan_lake;
        }
    }
    PathBuf::from("lake")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn dotenv_parses_quotes_exports_and_comments() {
        let _g = env_lock().lock().unwrap();
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join(".env");
        std::fs::write(
            &p,
            "# comment\nexport PROOFSYNC_TEST_A=\"quoted\"\nPROOFSYNC_TEST_B='single'\nnot a pair\n=novalue\n",
        )
        .unwrap();
        std::env::remove_var("PROOFSYNC_TEST_A");
        std::env::remove_var("PROOFSYNC_TEST_B");
        let m = parse_dotenv(&p);
        assert_eq!(m.get("PROOFSYNC_TEST_A").map(String::as_str), Some("quoted"));
        assert_eq!(m.get("PROOFSYNC_TEST_B").map(String::as_str), Some("single"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn dotenv_never_overrides_existing_env() {
        let _g = env_lock().lock().unwrap();
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join(".env"), "PROOFSYNC_TEST_C=from_file\n").unwrap();
        std::env::set_var("PROOFSYNC_TEST_C", "from_env");
        load_dotenv_if_present(td.path());
        assert_eq!(std::env::var("PROOFSYNC_TEST_C").unwrap(), "from_env");
        std::env::remove_var("PROOFSYNC_TEST_C");
    }

    #[test]
    fn from_env_reads_overrides() {
        let _g = env_lock().lock().unwrap();
        let td = tempfile::tempdir().unwrap();
        std::fs::write(
            td.path().join(".env"),
            "PROOFSYNC_RPC_TIMEOUT_S=5\nPROOFSYNC_EMPTY_PAYLOAD=reset\n",
        )
        .unwrap();
        std::env::remove_var("PROOFSYNC_RPC_TIMEOUT_S");
        std::env::remove_var("PROOFSYNC_EMPTY_PAYLOAD");
        std::env::set_var("PROOFSYNC_TRANSIENT_MARKERS", "not running; starting up ;");
        std::env::set_var("PROOFSYNC_SERVER_ARGS", "env lean --server");

        let cfg = Config::from_env(td.path()).unwrap();
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(5));
        assert_eq!(cfg.empty_payload, EmptyPayloadPolicy::ResetToEmpty);
        assert_eq!(cfg.transient_markers, vec!["not running", "starting up"]);
        assert_eq!(cfg.server_args, vec!["env", "lean", "--server"]);
        let opts = cfg.manager_options();
        assert_eq!(opts.rpc.timeout, Duration::from_secs(5));

        for k in [
            "PROOFSYNC_RPC_TIMEOUT_S",
            "PROOFSYNC_EMPTY_PAYLOAD",
            "PROOFSYNC_TRANSIENT_MARKERS",
            "PROOFSYNC_SERVER_ARGS",
        ] {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn bad_integer_is_reported() {
        let _g = env_lock().lock().unwrap();
        let td = tempfile::tempdir().unwrap();
        std::env::set_var("PROOFSYNC_KEEPALIVE_S", "soon");
        let err = Config::from_env(td.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotAnInteger { .. }));
        std::env::remove_var("PROOFSYNC_KEEPALIVE_S");
    }
}
