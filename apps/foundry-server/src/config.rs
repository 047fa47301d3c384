use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("FOUNDRY_SHARED_SECRET must be 64 hex characters")]
    BadSecret,
}

/// Effective agent configuration: defaults, then the TOML file, then `FOUNDRY_*` env.
#[derive(Debug, Clone)]
pub(crate) struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub app_root: PathBuf,
    pub wp_bin: String,
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub install_dir: Option<PathBuf>,
    pub update_url: Option<String>,
    pub shared_secret: Option<String>,
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub http_max_conc: usize,
    pub trust_forward: bool,
    pub admin_actors: Vec<String>,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    port: Option<u16>,
    app_root: Option<PathBuf>,
    wp_bin: Option<String>,
    state_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    install_dir: Option<PathBuf>,
    update_url: Option<String>,
    shared_secret: Option<String>,
    rate_limit: Option<u32>,
    rate_window_secs: Option<u64>,
    http_max_conc: Option<usize>,
    trust_forward: Option<bool>,
    admin_actors: Option<Vec<String>>,
    max_upload_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let state_dir = std::env::temp_dir().join("foundry-agent");
        Self {
            bind: "127.0.0.1".into(),
            port: 8093,
            app_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            wp_bin: "wp".into(),
            cache_dir: state_dir.join("wp-cli-cache"),
            state_dir,
            install_dir: None,
            update_url: None,
            shared_secret: None,
            rate_limit: 10,
            rate_window_secs: 60,
            http_max_conc: 256,
            trust_forward: false,
            admin_actors: Vec::new(),
            max_upload_bytes: 256 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(|key| std::env::var(key).ok())
    }

    pub fn load_from<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = ServerConfig::default();
        if let Some(path) = get("FOUNDRY_CONFIG") {
            cfg.apply_file(Path::new(&path))?;
            info!(path = %path, "loaded agent config file");
        }

        if let Some(v) = get("FOUNDRY_BIND") {
            cfg.bind = v;
        }
        if let Some(v) = get("FOUNDRY_PORT") {
            cfg.port = parse_num("FOUNDRY_PORT", &v)?;
        }
        if let Some(v) = get("FOUNDRY_APP_ROOT") {
            cfg.app_root = PathBuf::from(v);
        }
        if let Some(v) = get("FOUNDRY_WP_BIN") {
            cfg.wp_bin = v;
        }
        if let Some(v) = get("FOUNDRY_STATE_DIR") {
            cfg.state_dir = PathBuf::from(v);
            cfg.cache_dir = cfg.state_dir.join("wp-cli-cache");
        }
        if let Some(v) = get("FOUNDRY_CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FOUNDRY_INSTALL_DIR") {
            cfg.install_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("FOUNDRY_UPDATE_URL") {
            cfg.update_url = Some(v);
        }
        if let Some(v) = get("FOUNDRY_SHARED_SECRET") {
            cfg.shared_secret = Some(v);
        }
        if let Some(v) = get("FOUNDRY_RATE_LIMIT") {
            cfg.rate_limit = parse_num("FOUNDRY_RATE_LIMIT", &v)?;
        }
        if let Some(v) = get("FOUNDRY_RATE_WINDOW_SECS") {
            cfg.rate_window_secs = parse_num("FOUNDRY_RATE_WINDOW_SECS", &v)?;
        }
        if let Some(v) = get("FOUNDRY_HTTP_MAX_CONC") {
            cfg.http_max_conc = parse_num("FOUNDRY_HTTP_MAX_CONC", &v)?;
        }
        if let Some(v) = get("FOUNDRY_TRUST_FORWARD_HEADERS") {
            cfg.trust_forward = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = get("FOUNDRY_ADMIN_ACTORS") {
            cfg.admin_actors = v
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
        }
        if let Some(v) = get("FOUNDRY_MAX_UPLOAD_BYTES") {
            cfg.max_upload_bytes = parse_num("FOUNDRY_MAX_UPLOAD_BYTES", &v)?;
        }
        cfg.check()?;
        Ok(cfg)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if let Some(v) = file.bind {
            self.bind = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.app_root {
            self.app_root = v;
        }
        if let Some(v) = file.wp_bin {
            self.wp_bin = v;
        }
        if let Some(v) = file.state_dir {
            self.cache_dir = v.join("wp-cli-cache");
            self.state_dir = v;
        }
        if let Some(v) = file.cache_dir {
            self.cache_dir = v;
        }
        self.install_dir = file.install_dir.or(self.install_dir.take());
        self.update_url = file.update_url.or(self.update_url.take());
        self.shared_secret = file.shared_secret.or(self.shared_secret.take());
        if let Some(v) = file.rate_limit {
            self.rate_limit = v;
        }
        if let Some(v) = file.rate_window_secs {
            self.rate_window_secs = v;
        }
        if let Some(v) = file.http_max_conc {
            self.http_max_conc = v;
        }
        if let Some(v) = file.trust_forward {
            self.trust_forward = v;
        }
        if let Some(v) = file.admin_actors {
            self.admin_actors = v;
        }
        if let Some(v) = file.max_upload_bytes {
            self.max_upload_bytes = v;
        }
        Ok(())
    }

    fn check(&self) -> Result<(), ConfigError> {
        if let Some(secret) = &self.shared_secret {
            if secret.len() != 64 || !crate::util::is_hex(secret) {
                return Err(ConfigError::BadSecret);
            }
        }
        if self.rate_window_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "rate_window_secs",
                value: "0".into(),
            });
        }
        if self.http_max_conc == 0 {
            return Err(ConfigError::Invalid {
                key: "http_max_conc",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "FOUNDRY_BIND",
                value: self.bind.clone(),
            })
    }

    /// Directory holding staged archives, sidecars and uploads.
    pub fn archive_dir(&self) -> PathBuf {
        self.state_dir.join("archives")
    }

    pub fn secret_path(&self) -> PathBuf {
        self.state_dir.join("shared_secret")
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env;
    use std::collections::HashMap;

    fn lookup(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_apply_without_env() {
        let cfg = ServerConfig::load_from(|_| None).unwrap();
        assert_eq!(cfg.port, 8093);
        assert_eq!(cfg.rate_limit, 10);
        assert_eq!(cfg.rate_window_secs, 60);
        assert_eq!(cfg.wp_bin, "wp");
        assert!(cfg.cache_dir.starts_with(&cfg.state_dir));
    }

    #[test]
    fn env_overrides_state_and_cache_dirs() {
        let cfg = ServerConfig::load_from(lookup(HashMap::from([
            ("FOUNDRY_STATE_DIR", "/srv/foundry"),
            ("FOUNDRY_PORT", "9000"),
            ("FOUNDRY_ADMIN_ACTORS", "alice, bob ,"),
        ])))
        .unwrap();
        assert_eq!(cfg.state_dir, PathBuf::from("/srv/foundry"));
        assert_eq!(cfg.cache_dir, PathBuf::from("/srv/foundry/wp-cli-cache"));
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.admin_actors, vec!["alice", "bob"]);
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = ServerConfig::load_from(lookup(HashMap::from([("FOUNDRY_PORT", "http")])))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FOUNDRY_PORT", .. }));
    }

    #[test]
    fn short_secret_is_rejected() {
        let err =
            ServerConfig::load_from(lookup(HashMap::from([("FOUNDRY_SHARED_SECRET", "abcd")])))
                .unwrap_err();
        assert!(matches!(err, ConfigError::BadSecret));
    }

    #[test]
    fn file_values_are_overridden_by_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "port = 7001\nwp_bin = \"/usr/local/bin/wp\"\nrate_limit = 3\n",
        )
        .unwrap();
        let mut guard = env::guard();
        guard.set("FOUNDRY_CONFIG", path.display().to_string());
        guard.set("FOUNDRY_RATE_LIMIT", "5");
        guard.remove("FOUNDRY_PORT");
        let cfg = ServerConfig::load().unwrap();
        assert_eq!(cfg.port, 7001);
        assert_eq!(cfg.wp_bin, "/usr/local/bin/wp");
        assert_eq!(cfg.rate_limit, 5);
    }

    #[test]
    fn unknown_file_keys_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "colour = \"blue\"\n").unwrap();
        let p = path.display().to_string();
        let err = ServerConfig::load_from(move |key| (key == "FOUNDRY_CONFIG").then(|| p.clone()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
