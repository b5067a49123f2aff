use anyhow::{Result, anyhow};
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub http: Http,
    pub log: Log,
    pub auth: Auth,
    pub rate_limit: RateLimit,
    pub bus: Bus,
    pub store: Store,
    pub presence: Presence,
    pub persistence: Persistence,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Http {
    pub address: String,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Log {
    pub filter: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Auth {
    pub enabled: bool,
    pub access_secret: String,
    pub refresh_secret: String, // empty: reuse access_secret
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub cookie_domain: String,
    pub cookie_secure: bool,
    pub cors_origin: String,
}

impl Auth {
    pub fn refresh_secret(&self) -> &str {
        if self.refresh_secret.is_empty() {
            &self.access_secret
        } else {
            &self.refresh_secret
        }
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            enabled: false,
            access_secret: "dev-access-secret".to_string(),
            refresh_secret: String::new(),
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 24 * 60 * 60,
            cookie_domain: String::new(),
            cookie_secure: false,
            cors_origin: "http://localhost:3000".to_string(),
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("enabled", &self.enabled)
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("cookie_domain", &self.cookie_domain)
            .field("cookie_secure", &self.cookie_secure)
            .field("cors_origin", &self.cors_origin)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    pub enabled: bool,
    pub rate_per_sec: f64,
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_per_sec: 5.0,
            burst: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Bus {
    pub backend: String, // "nats" or "memory"
    pub url: String,
    pub name: String,
    pub connect_timeout_secs: u64,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            url: "nats://127.0.0.1:4222".to_string(),
            name: "stormgate".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Store {
    pub backend: String, // "mysql", "memory" or "none"
    pub dsn: String,
    pub connect_attempts: u32,
    pub connect_delay_ms: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            dsn: String::new(),
            connect_attempts: 10,
            connect_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Presence {
    pub backend: String, // "redis", "memory" or "none"
    pub url: String,
    pub key_prefix: String,
    pub connect_attempts: u32,
    pub connect_delay_ms: u64,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "presence".to_string(),
            connect_attempts: 10,
            connect_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Persistence {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

/// Reads `path` (or the build's default file), then applies `STORMGATE__*`
/// environment overrides, e.g. `STORMGATE__AUTH__ACCESS_SECRET`.
pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let file = match path {
        Some(path) => File::with_name(path),
        None => File::with_name(SETTINGS_PATH).required(false),
    };

    let settings: Settings = Config::builder()
        .add_source(file)
        .add_source(Environment::with_prefix("STORMGATE").separator("__"))
        .build()
        .map_err(|e| anyhow!(e))?
        .try_deserialize()
        .map_err(|e| anyhow!(e))?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_secret_falls_back_to_access_secret() {
        let mut auth = Auth {
            access_secret: "a".to_string(),
            ..Auth::default()
        };
        assert_eq!(auth.refresh_secret(), "a");
        auth.refresh_secret = "r".to_string();
        assert_eq!(auth.refresh_secret(), "r");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let auth = Auth {
            access_secret: "top-secret".to_string(),
            ..Auth::default()
        };
        assert!(!format!("{auth:?}").contains("top-secret"));
    }
}
