#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_ARCHIVE_DELETE_DELAY_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub download_root: PathBuf,
    pub www_root: Option<PathBuf>,
    pub port: u16,
    pub host: String,
    pub ytdlp_bin: PathBuf,
    /// Grace period between the end of an archive download and its deletion.
    pub archive_delete_delay: Duration,
}

/// Values given on the command line. They win over the environment and the
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub download_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<ServerConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_config(&file_vars, env_var_string, overrides))
}

fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> ServerConfig {
    let download_root = overrides
        .download_root
        .or_else(|| lookup_value("DOWNLOAD_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_ROOT));
    let www_root = overrides
        .www_root
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup).map(PathBuf::from));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEZIP_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("TUBEZIP_HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup_value("YTDLP_BIN", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let delay_secs = lookup_value("ARCHIVE_DELETE_DELAY_SECS", file_vars, &env_lookup)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_ARCHIVE_DELETE_DELAY_SECS);

    ServerConfig {
        download_root,
        www_root,
        port,
        host,
        ytdlp_bin,
        archive_delete_delay: Duration::from_secs(delay_secs),
    }
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
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Reads `KEY=value` pairs, tolerating `export`, quotes and comments. A
/// missing file yields an empty map.
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
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> ServerConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_config(&vars, |_| None, ConfigOverrides::default())
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let config = config_from("");
        assert_eq!(config.download_root, PathBuf::from(DEFAULT_DOWNLOAD_ROOT));
        assert_eq!(config.www_root, None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.ytdlp_bin, PathBuf::from("yt-dlp"));
        assert_eq!(config.archive_delete_delay, Duration::from_secs(5));
    }

    #[test]
    fn file_values_are_read() {
        let config = config_from(
            "DOWNLOAD_ROOT=\"/srv/zips\"\nWWW_ROOT=/srv/www\nTUBEZIP_PORT=\"4242\"\nTUBEZIP_HOST=0.0.0.0\nYTDLP_BIN=/opt/yt-dlp\nARCHIVE_DELETE_DELAY_SECS=30\n",
        );
        assert_eq!(config.download_root, PathBuf::from("/srv/zips"));
        assert_eq!(config.www_root, Some(PathBuf::from("/srv/www")));
        assert_eq!(config.port, 4242);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.ytdlp_bin, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(config.archive_delete_delay, Duration::from_secs(30));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export DOWNLOAD_ROOT="/media"
            WWW_ROOT='/www'
            TUBEZIP_HOST =  "0.0.0.0"
            TUBEZIP_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("DOWNLOAD_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("TUBEZIP_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("TUBEZIP_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn env_beats_file_and_overrides_beat_env() {
        let vars = read_env_file(
            make_config("DOWNLOAD_ROOT=\"/file\"\nTUBEZIP_PORT=\"7000\"\nTUBEZIP_HOST=file-host\n")
                .path(),
        )
        .unwrap();
        let env = |key: &str| match key {
            "DOWNLOAD_ROOT" => Some("/env".to_string()),
            "TUBEZIP_PORT" => Some("8000".to_string()),
            _ => None,
        };

        let config = build_config(&vars, env, ConfigOverrides::default());
        assert_eq!(config.download_root, PathBuf::from("/env"));
        assert_eq!(config.port, 8000);
        assert_eq!(config.host, "file-host");

        let config = build_config(
            &vars,
            env,
            ConfigOverrides {
                download_root: Some(PathBuf::from("/cli")),
                port: Some(9000),
                host: Some("   ".into()),
                ..ConfigOverrides::default()
            },
        );
        assert_eq!(config.download_root, PathBuf::from("/cli"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "file-host");
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config_from("TUBEZIP_PORT=\"nope\"\nARCHIVE_DELETE_DELAY_SECS=soon\nWWW_ROOT=\"\"\n");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.archive_delete_delay, Duration::from_secs(5));
        assert_eq!(config.www_root, None);
    }
}
