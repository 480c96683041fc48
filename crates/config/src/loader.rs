use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::CourierConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "courier.toml",
    "courier.yaml",
    "courier.yml",
    "courier.json",
];

/// Prefix for environment overrides of `[sending]` keys.
const ENV_PREFIX: &str = "COURIER_SENDING_";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<CourierConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply env overrides.
///
/// Search order:
/// 1. `./courier.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/courier/courier.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `CourierConfig::default()` when nothing is found or the file
/// does not parse.
pub fn discover_and_load() -> CourierConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                CourierConfig::default()
            })
        },
        None => {
            debug!("no config file found, using defaults");
            CourierConfig::default()
        },
    };
    apply_env_overrides(&mut config);
    config
}

/// Returns the user-global config directory (`~/.config/courier/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "courier").map(|d| d.config_dir().to_path_buf())
}

/// Apply `COURIER_SENDING_<KEY>` environment variables on top of `config`.
pub fn apply_env_overrides(config: &mut CourierConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(config: &mut CourierConfig, lookup: impl Fn(&str) -> Option<String>) {
    let sending = &mut config.sending;
    let fields: [(&str, &mut u64); 5] = [
        ("CACHE_TTL_SECS", &mut sending.cache_ttl_secs),
        ("BLOCK_RETRY_WINDOW_MS", &mut sending.block_retry_window_ms),
        ("POLL_INTERVAL_MS", &mut sending.poll_interval_ms),
        ("SWEEP_INTERVAL_SECS", &mut sending.sweep_interval_secs),
        ("STOP_TIMEOUT_SECS", &mut sending.stop_timeout_secs),
    ];

    for (suffix, slot) in fields {
        let name = format!("{ENV_PREFIX}{suffix}");
        let Some(raw) = lookup(&name) else {
            continue;
        };
        match raw.trim().parse::<u64>() {
            Ok(value) => {
                debug!(var = %name, value, "config override from environment");
                *slot = value;
            },
            Err(e) => warn!(var = %name, value = %raw, error = %e, "ignoring invalid override"),
        }
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

fn parse_config(raw: &str, path: &Path) -> Result<CourierConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat {
            extension: other.to_string(),
        }),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, std::io::Write};

    fn write_config(name: &str, body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    #[rstest]
    #[case("courier.toml", "[sending]\ncache_ttl_secs = 42\n")]
    #[case("courier.yaml", "sending:\n  cache_ttl_secs: 42\n")]
    #[case("courier.json", r#"{"sending": {"cache_ttl_secs": 42}}"#)]
    fn loads_every_format(#[case] name: &str, #[case] body: &str) {
        let (_dir, path) = write_config(name, body);
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.sending.cache_ttl_secs, 42);
        assert_eq!(cfg.sending.block_retry_window_ms, 5000);
    }

    #[test]
    fn rejects_unknown_extension() {
        let (_dir, path) = write_config("courier.ini", "cache_ttl_secs=1");
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { extension } if extension == "ini"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/courier.toml")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn env_overrides_replace_parsed_values() {
        let mut cfg = CourierConfig::default();
        apply_env_overrides_with(&mut cfg, |name| match name {
            "COURIER_SENDING_POLL_INTERVAL_MS" => Some("25".into()),
            "COURIER_SENDING_STOP_TIMEOUT_SECS" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(cfg.sending.poll_interval_ms, 25);
        assert_eq!(cfg.sending.stop_timeout_secs, 10);
    }
}
