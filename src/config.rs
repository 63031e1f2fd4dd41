//! Configuration (C8): loads the merged configuration document from
//! layered INI files, per §4.9/§6.
//!
//! Grounded on `x84/bbs/ini.init(lookup_bbs, lookup_log)`, which tries a
//! tuple of candidate paths in order and falls back to built-in defaults
//! when none exist. The Rust translation keeps the same lookup order but
//! makes every key's default explicit instead of relying on `ConfigParser`
//! fallback strings scattered through call sites.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;

use crate::error::ConfigError;

const APP_NAME: &str = "bbsd";

const DEFAULT_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 6023;
const DEFAULT_TIMEOUT_SECS: u64 = 1200;
const DEFAULT_MAX_CONNECTIONS: usize = 250;

/// The merged view of the main configuration file consumed by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub telnet_addr: IpAddr,
    pub telnet_port: u16,
    pub session_timeout: Duration,
    pub password_digest: String,
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            telnet_addr: DEFAULT_ADDR.parse().unwrap(),
            telnet_port: DEFAULT_PORT,
            session_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            password_digest: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Standard home-directory lookup order for a config file of the given
/// base name, tried when no explicit `--config`/`--logger` path is given:
/// `/etc/<app>/<name>`, then `~/.<app>/<name>`.
fn default_lookup(name: &str) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(format!("/etc/{}/{}", APP_NAME, name))];
    if let Some(home) = home_dir() {
        candidates.push(home.join(format!(".{}", APP_NAME)).join(name));
    }
    candidates
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Resolves the main configuration document.
///
/// `explicit` is the `--config` flag, if given. When absent, the standard
/// lookup order is tried; if none of those paths exist either, the
/// built-in defaults are used wholesale and no error is raised (§4.9).
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_lookup("default.ini").into_iter().find(|p| p.exists()),
    };

    let path = match path {
        Some(path) => path,
        None => return Ok(Config::default()),
    };

    let ini = read_ini(&path)?;
    parse(&ini, &path)
}

fn read_ini(path: &Path) -> Result<Ini, ConfigError> {
    Ini::load_from_file(path).map_err(|err| match err {
        ini::Error::Io(source) => ConfigError::Read {
            path: path.display().to_string(),
            source,
        },
        ini::Error::Parse(source) => ConfigError::Parse {
            path: path.display().to_string(),
            source: ini::Error::Parse(source),
        },
    })
}

fn parse(ini: &Ini, path: &Path) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    if let Some(section) = ini.section(Some("telnet")) {
        if let Some(addr) = section.get("addr") {
            config.telnet_addr = addr.parse().map_err(|_| ConfigError::InvalidValue {
                section: "telnet".to_string(),
                key: "addr".to_string(),
                value: addr.to_string(),
            })?;
        }
        match section.get("port") {
            Some(port) => {
                config.telnet_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                    section: "telnet".to_string(),
                    key: "port".to_string(),
                    value: port.to_string(),
                })?
            }
            None => {
                return Err(ConfigError::MissingKey {
                    section: "telnet".to_string(),
                    key: "port".to_string(),
                })
            }
        }
    } else {
        return Err(ConfigError::MissingKey {
            section: "telnet".to_string(),
            key: "port".to_string(),
        });
    }

    if let Some(section) = ini.section(Some("system")) {
        if let Some(timeout) = section.get("timeout") {
            let secs: u64 = timeout.parse().map_err(|_| ConfigError::InvalidValue {
                section: "system".to_string(),
                key: "timeout".to_string(),
                value: timeout.to_string(),
            })?;
            config.session_timeout = Duration::from_secs(secs);
        }
        match section.get("password_digest") {
            Some(digest) => config.password_digest = digest.to_string(),
            None => {
                return Err(ConfigError::MissingKey {
                    section: "system".to_string(),
                    key: "password_digest".to_string(),
                })
            }
        }
        if let Some(max) = section.get("max_connections") {
            config.max_connections = max.parse().map_err(|_| ConfigError::InvalidValue {
                section: "system".to_string(),
                key: "max_connections".to_string(),
                value: max.to_string(),
            })?;
        }
    } else {
        return Err(ConfigError::MissingKey {
            section: "system".to_string(),
            key: "password_digest".to_string(),
        });
    }

    let _ = path; // kept for future diagnostics; errors above already embed it.
    Ok(config)
}

/// Resolves the logging configuration path using the same lookup order,
/// under `logging.ini` rather than `default.ini`. Returns `None` when no
/// candidate exists — a missing logging file is not a `ConfigError`
/// (§6): the caller falls back to a default filter.
pub fn resolve_logging_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_lookup("logging.ini").into_iter().find(|p| p.exists()),
    }
}
