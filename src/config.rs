#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_FEEDS_PORT: u16 = 8080;
pub const DEFAULT_FEEDS_HOST: &str = "127.0.0.1";
pub const DEFAULT_CACHE_DIR: &str = "/tmp/feeds-video-cache";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_MAX_DOWNLOADS: usize = 5;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Everything the backend needs to know before it binds a socket.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub host: IpAddr,
    pub port: u16,
    pub cache_dir: PathBuf,
    pub ytdlp_bin: PathBuf,
    pub cookies_path: Option<PathBuf>,
    pub max_downloads: usize,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
}

/// Values coming from the command line. They win over the environment and the
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cache_dir: Option<PathBuf>,
    pub ytdlp_bin: Option<PathBuf>,
    pub cookies_path: Option<PathBuf>,
    pub max_downloads: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let host_raw = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("FEEDS_HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_FEEDS_HOST.to_string());
    let host = host_raw
        .parse::<IpAddr>()
        .with_context(|| format!("expected a valid IPv4 or IPv6 address, got {host_raw:?}"))?;
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("FEEDS_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_FEEDS_PORT);
    let cache_dir = overrides
        .cache_dir
        .or_else(|| lookup_value("FEEDS_CACHE_DIR", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup_value("FEEDS_YTDLP", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let cookies_path = overrides.cookies_path.or_else(|| {
        lookup_value("FEEDS_YTDLP_COOKIES", file_vars, &env_lookup).map(PathBuf::from)
    });
    let max_downloads = overrides
        .max_downloads
        .or_else(|| {
            lookup_value("FEEDS_MAX_DOWNLOADS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_DOWNLOADS);
    let cache_ttl = lookup_secs("FEEDS_CACHE_TTL_SECS", file_vars, &env_lookup)
        .unwrap_or(DEFAULT_CACHE_TTL);
    let sweep_interval = lookup_secs("FEEDS_SWEEP_INTERVAL_SECS", file_vars, &env_lookup)
        .unwrap_or(DEFAULT_SWEEP_INTERVAL);

    Ok(RuntimeSettings {
        host,
        port,
        cache_dir,
        ytdlp_bin,
        cookies_path,
        max_downloads,
        cache_ttl,
        sweep_interval,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

fn lookup_secs(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<Duration> {
    lookup_value(key, file_vars, env_lookup)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None).unwrap()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let settings = settings_from("");
        assert_eq!(settings.port, DEFAULT_FEEDS_PORT);
        assert_eq!(settings.host.to_string(), DEFAULT_FEEDS_HOST);
        assert_eq!(settings.cache_dir, PathBuf::from(DEFAULT_CACHE_DIR));
        assert_eq!(settings.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
        assert_eq!(settings.cookies_path, None);
        assert_eq!(settings.max_downloads, DEFAULT_MAX_DOWNLOADS);
        assert_eq!(settings.cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(settings.sweep_interval, DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn reads_every_key_from_file() {
        let settings = settings_from(
            "FEEDS_HOST=\"0.0.0.0\"\nFEEDS_PORT=\"4242\"\nFEEDS_CACHE_DIR=\"/cache\"\n\
             FEEDS_YTDLP=\"/opt/yt-dlp\"\nFEEDS_YTDLP_COOKIES=\"/etc/cookies.txt\"\n\
             FEEDS_MAX_DOWNLOADS=\"2\"\nFEEDS_CACHE_TTL_SECS=\"60\"\nFEEDS_SWEEP_INTERVAL_SECS=\"5\"\n",
        );
        assert_eq!(settings.host.to_string(), "0.0.0.0");
        assert_eq!(settings.port, 4242);
        assert_eq!(settings.cache_dir, PathBuf::from("/cache"));
        assert_eq!(settings.ytdlp_bin, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(
            settings.cookies_path,
            Some(PathBuf::from("/etc/cookies.txt"))
        );
        assert_eq!(settings.max_downloads, 2);
        assert_eq!(settings.cache_ttl, Duration::from_secs(60));
        assert_eq!(settings.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from(
            "FEEDS_PORT=\"nope\"\nFEEDS_MAX_DOWNLOADS=\"0\"\nFEEDS_CACHE_TTL_SECS=\"-1\"\n",
        );
        assert_eq!(settings.port, DEFAULT_FEEDS_PORT);
        assert_eq!(settings.max_downloads, DEFAULT_MAX_DOWNLOADS);
        assert_eq!(settings.cache_ttl, DEFAULT_CACHE_TTL);
    }

    #[test]
    fn invalid_host_is_an_error() {
        let vars =
            read_env_file(make_config("FEEDS_HOST=\"not-an-ip\"\n").path()).unwrap();
        let err = build_runtime_settings(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("IPv4 or IPv6"));
    }

    #[test]
    fn env_wins_over_file() {
        let vars =
            read_env_file(make_config("FEEDS_CACHE_DIR=\"/file\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            if key == "FEEDS_CACHE_DIR" {
                Some("/env".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(settings.cache_dir, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export FEEDS_CACHE_DIR="/media"
            FEEDS_YTDLP='/bin/yt-dlp'
            FEEDS_HOST =  "0.0.0.0"
            FEEDS_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("FEEDS_CACHE_DIR").unwrap(), "/media");
        assert_eq!(vars.get("FEEDS_YTDLP").unwrap(), "/bin/yt-dlp");
        assert_eq!(vars.get("FEEDS_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("FEEDS_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("FEEDS_CACHE_DIR".to_string(), "/file-cache".to_string());
        vars.insert("FEEDS_YTDLP".to_string(), "/file-ytdlp".to_string());
        vars.insert("FEEDS_HOST".to_string(), "10.0.0.1".to_string());
        vars.insert("FEEDS_PORT".to_string(), "7000".to_string());
        vars.insert("FEEDS_MAX_DOWNLOADS".to_string(), "3".to_string());

        let overrides = RuntimeOverrides {
            cache_dir: Some(PathBuf::from("/override-cache")),
            port: Some(9000),
            host: Some("::1".into()),
            max_downloads: Some(8),
            ..RuntimeOverrides::default()
        };

        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| {
                if key == "FEEDS_YTDLP" {
                    Some("/env-ytdlp".to_string())
                } else if key == "FEEDS_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(settings.cache_dir, PathBuf::from("/override-cache"));
        assert_eq!(settings.ytdlp_bin, PathBuf::from("/env-ytdlp"));
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.host.to_string(), "::1");
        assert_eq!(settings.max_downloads, 8);
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let vars = HashMap::new();
        let settings = build_runtime_settings_with_overrides(
            &vars,
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.host.to_string(), DEFAULT_FEEDS_HOST);
    }
}
