//! Loads `./config.toml` in the crate root and validates options.

use crate::deserializers::deserialize_logging_filter;
use crate::errors::{JmError, Result};
use crate::paths::*;

use std::fs;
use std::path::PathBuf;

use log::LevelFilter;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pdf,
    Zip,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Client {
    /// Api domains, tried in order. Bare hosts get `https://` prepended.
    pub api_hosts: Vec<String>,
    /// Image cdn domains, tried in order.
    pub image_hosts: Vec<String>,
    /// Where a fresh list of api domains is published once all of ours fail.
    pub directory_urls: Vec<Url>,
    pub user_agent: String,
    pub app_version: String,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub token_secret: String,
    pub content_token_secret: String,
    pub data_secret: String,
    pub directory_secret: String,
    /// Body text the api returns when its database is down.
    pub backend_unavailable_marker: String,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            api_hosts: [
                "www.cdnaspa.vip",
                "www.cdnaspa.club",
                "www.cdnplaystation6.vip",
                "www.cdnplaystation6.cc",
            ]
            .map(String::from)
            .to_vec(),
            image_hosts: [
                "cdn-msp.jmapiproxy1.cc",
                "cdn-msp.jmapiproxy2.cc",
                "cdn-msp2.jmapiproxy2.cc",
                "cdn-msp3.jmapiproxy2.cc",
                "cdn-msp.jmapinodeudzn.net",
                "cdn-msp3.jmapinodeudzn.net",
            ]
            .map(String::from)
            .to_vec(),
            directory_urls: [
                "https://rup4a04-c01.tos-ap-southeast-1.bytepluses.com/newsvr-2025.txt",
                "https://rup4a04-c02.tos-cn-hongkong.bytepluses.com/newsvr-2025.txt",
            ]
            .iter()
            .filter_map(|u| Url::parse(u).ok())
            .collect(),
            user_agent: concat!(
                "Mozilla/5.0 (Linux; Android 9; V1938CT Build/PQ3A.190705.11211812; wv) ",
                "AppleWebKit/537.36 (KHTML, like Gecko) Version/4.0 Chrome/91.0.4472.114 Safari/537.36"
            )
            .to_string(),
            app_version: "1.7.9".to_string(),
            max_retries: 5,
            request_timeout_secs: 30,
            token_secret: "18comicAPP".to_string(),
            content_token_secret: "18comicAPPContent".to_string(),
            data_secret: "185Hcomic3PAPP7R".to_string(),
            directory_secret: "diosfjckwpqpdfjkvnqQjsik".to_string(),
            backend_unavailable_marker: "Could not connect to mysql".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Concurrency {
    pub download_permits: usize,
    pub decode_permits: usize,
    pub job_permits: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            download_permits: 10,
            decode_permits: 5,
            job_permits: 1,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Output {
    pub root: PathBuf,
    pub format: OutputFormat,
    pub password: Option<String>,
    pub level: u8,
    pub keep_cache: bool,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            root: download_save_dir().to_path_buf(),
            format: OutputFormat::Pdf,
            password: None,
            level: 6,
            keep_cache: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Logging {
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_logging_filter")]
    pub filter: LevelFilter,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: LevelFilter::Info,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub client: Client,
    pub concurrency: Concurrency,
    pub output: Output,
    pub logging: Logging,
}

impl Config {
    /// Rejects values that would deadlock or can't be honoured.
    pub fn validate(&self) -> Result<()> {
        let c = &self.concurrency;

        if c.download_permits == 0 || c.decode_permits == 0 || c.job_permits == 0 {
            return Err(JmError::Config("permits must be at least 1".into()));
        }

        if self.output.level > 9 {
            return Err(JmError::Config(format!(
                "compression level must be 0-9, got {}",
                self.output.level
            )));
        }

        if self.client.api_hosts.is_empty() {
            return Err(JmError::Config("`api_hosts` can't be empty".into()));
        }

        if self.client.image_hosts.is_empty() {
            return Err(JmError::Config("`image_hosts` can't be empty".into()));
        }

        Ok(())
    }
}

/// Parses and validates a config from TOML text.
pub fn parse_config(raw_config: &str) -> Result<Config> {
    let config: Config =
        toml::de::from_str(raw_config).map_err(|e| JmError::Config(e.to_string()))?;
    config.validate()?;

    Ok(config)
}

/// Loads the config stored in [`config_toml()`](`crate::paths::config_toml()`)
///
/// This also creates the log directory and the configured download root.
pub fn load_config() -> Result<Config> {
    let raw_config = fs::read_to_string(config_toml())?;
    let config = parse_config(&raw_config)?;

    for p in [config.output.root.as_path(), log_save_dir()] {
        fs::create_dir_all(p)?;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let cfg = parse_config(
            r#"
            [client]
            api_hosts = ["www.example.vip"]
            max_retries = 2

            [output]
            format = "zip"
            password = "hunter2"
            level = 9

            [logging]
            filter = "DEBUG"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.client.api_hosts, vec!["www.example.vip"]);
        assert_eq!(cfg.client.max_retries, 2);
        assert_eq!(cfg.client.app_version, "1.7.9");
        assert_eq!(cfg.concurrency.download_permits, 10);
        assert_eq!(cfg.concurrency.decode_permits, 5);
        assert_eq!(cfg.concurrency.job_permits, 1);
        assert_eq!(cfg.output.format, OutputFormat::Zip);
        assert_eq!(cfg.output.password.as_deref(), Some("hunter2"));
        assert_eq!(cfg.logging.filter, LevelFilter::Debug);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_config("[output]\nlevel = 10").is_err());
        assert!(parse_config("[concurrency]\njob_permits = 0").is_err());
        assert!(parse_config("[client]\napi_hosts = []").is_err());
        assert!(parse_config("[logging]\nfilter = \"LOUD\"").is_err());
    }
}
