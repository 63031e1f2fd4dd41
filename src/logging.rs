//! Logging (C9): process-wide `tracing` initialization, plus the bridge
//! that lets a session's forwarded `logger` records land in the same sink
//! as the core's own spans (§4.10).
//!
//! Grounded on the teacher's own `tracing_subscriber::FmtSubscriber`
//! bootstrap in its `bin/server.rs`, generalized to read an optional
//! level filter out of the layered `logging.ini` resolved by `config`.

use std::path::Path;

use ini::Ini;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Initializes the global `tracing` subscriber. Must be called exactly
/// once per process, before anything logs (the CLI entrypoint is the
/// only caller).
///
/// `logging_path`, when present, is expected to contain a `[logging]
/// level` key (e.g. `debug`, `warn`); a missing file, a missing section,
/// or a missing key all fall back to `DEFAULT_FILTER` rather than erroring
/// (§6: "missing optional logging file is not a `ConfigError`").
pub fn init(logging_path: Option<&Path>) {
    let filter = logging_path
        .and_then(read_level)
        .unwrap_or_else(|| DEFAULT_FILTER.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .init();
}

fn read_level(path: &Path) -> Option<String> {
    let ini = Ini::load_from_file(path).ok()?;
    ini.section(Some("logging"))?.get("level").map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn read_level_returns_none_for_missing_file() {
        assert_eq!(read_level(Path::new("/definitely/not/here.ini")), None);
    }

    #[test]
    fn read_level_extracts_configured_level() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"[logging]\nlevel=debug\n").unwrap();
        assert_eq!(read_level(tmp.path()).as_deref(), Some("debug"));
    }

    #[test]
    fn read_level_returns_none_without_logging_section() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"[other]\nkey=val\n").unwrap();
        assert_eq!(read_level(tmp.path()), None);
    }
}
