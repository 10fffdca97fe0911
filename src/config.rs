use federation::{BootstrapMode, FederationError, SigningKey, StaticTrust};
use reqwest::Url;
use serde::Deserialize;
use std::{collections::BTreeSet, time::Duration};

/// Path of the config file when `CONFIG_PATH` isn't set.
pub static DEFAULT_CONFIG_PATH: &str = "Config.toml";

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Config.toml as written on disk.
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfigDeserialize {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Used when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub wsfed: WsFedConfigDeserialize,
}

/// The `[wsfed]` table, i.e. the `wsfed:*` settings.
#[derive(Clone, Deserialize, Debug)]
pub struct WsFedConfigDeserialize {
    /// `wtrealm`, the identifier the identity provider knows this application by.
    pub realm: Option<String>,
    /// Address of the federation metadata document.
    pub metadata: Option<String>,
    #[serde(default)]
    pub bootstrap: BootstrapMode,
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    #[serde(default = "default_metadata_ttl_secs")]
    pub metadata_ttl_secs: u64,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
    /// Issuers trusted in addition to the one the metadata names.
    #[serde(default)]
    pub valid_issuers: Vec<String>,
    /// Base64 DER certificates trusted in addition to the metadata's signing certificates.
    #[serde(default)]
    pub signing_certificates: Vec<String>,
    /// `wreply` sent with sign-in requests.
    pub reply_url: Option<String>,
    /// Sign-in endpoint to use instead of the metadata's passive requestor endpoint.
    pub sign_in_url: Option<String>,
}

impl Default for WsFedConfigDeserialize {
    fn default() -> Self {
        Self {
            realm: None,
            metadata: None,
            bootstrap: BootstrapMode::default(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            metadata_ttl_secs: default_metadata_ttl_secs(),
            clock_skew_secs: default_clock_skew_secs(),
            valid_issuers: Vec::new(),
            signing_certificates: Vec::new(),
            reply_url: None,
            sign_in_url: None,
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metadata_timeout_secs() -> u64 {
    10
}

fn default_metadata_ttl_secs() -> u64 {
    12 * 60 * 60
}

fn default_clock_skew_secs() -> u64 {
    300
}

impl AppConfigDeserialize {
    /// Parses Config.toml, reporting the offending key path on failure.
    pub fn from_toml_str(contents: &str) -> Result<Self, FederationError> {
        let deserializer = toml::Deserializer::new(contents);
        serde_path_to_error::deserialize(deserializer).map_err(|err| {
            FederationError::Configuration(format!("{}: {}", err.path(), err.inner()))
        })
    }

    /// `WSFED__REALM` and `WSFED__METADATA` win over the file.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(realm) = var("WSFED__REALM") {
            self.wsfed.realm = Some(realm);
        }
        if let Some(metadata) = var("WSFED__METADATA") {
            self.wsfed.metadata = Some(metadata);
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub environment: Environment,
    pub listen_address: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub metadata_address: Url,
    pub bootstrap_mode: BootstrapMode,
    pub metadata_timeout: Duration,
    pub metadata_ttl: Duration,
    pub clock_skew: Duration,
    pub trust: StaticTrust,
    pub reply_url: Option<Url>,
}

fn config_error(message: impl Into<String>) -> FederationError {
    FederationError::Configuration(message.into())
}

fn parse_url(key: &str, value: &str) -> Result<Url, FederationError> {
    let url = Url::parse(value).map_err(|err| config_error(format!("{key}: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(config_error(format!("{key}: unsupported scheme {scheme}"))),
    }
}

impl AppConfig {
    pub fn new(other: AppConfigDeserialize) -> Result<AppConfig, FederationError> {
        let wsfed = other.wsfed;
        let realm = wsfed
            .realm
            .filter(|realm| !realm.trim().is_empty())
            .ok_or_else(|| config_error("wsfed.realm is required"))?;
        let metadata = wsfed
            .metadata
            .filter(|metadata| !metadata.trim().is_empty())
            .ok_or_else(|| config_error("wsfed.metadata is required"))?;
        let metadata_address = parse_url("wsfed.metadata", &metadata)?;

        let signing_keys = wsfed
            .signing_certificates
            .iter()
            .enumerate()
            .map(|(i, certificate)| {
                SigningKey::from_certificate_base64(certificate)
                    .map_err(|err| config_error(format!("wsfed.signing_certificates[{i}]: {err}")))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        let sign_in_endpoint = wsfed
            .sign_in_url
            .as_deref()
            .map(|url| parse_url("wsfed.sign_in_url", url))
            .transpose()?;
        let reply_url = wsfed
            .reply_url
            .as_deref()
            .map(|url| parse_url("wsfed.reply_url", url))
            .transpose()?;

        Ok(AppConfig {
            environment: other.environment,
            listen_address: other.listen_address,
            log_level: other.log_level,
            log_format: other.log_format,
            metadata_address,
            bootstrap_mode: wsfed.bootstrap,
            metadata_timeout: Duration::from_secs(wsfed.metadata_timeout_secs),
            metadata_ttl: Duration::from_secs(wsfed.metadata_ttl_secs),
            clock_skew: Duration::from_secs(wsfed.clock_skew_secs),
            trust: StaticTrust {
                realm,
                valid_issuers: wsfed.valid_issuers.into_iter().collect(),
                signing_keys,
                sign_in_endpoint,
            },
            reply_url,
        })
    }

    /// Reads `CONFIG_PATH` (or Config.toml in the working directory) and applies env overrides.
    /// A missing file is fine as long as the environment supplies the required settings.
    pub fn load() -> Result<AppConfig, FederationError> {
        let path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(config_error(format!("{path}: {err}"))),
        };
        let mut config = AppConfigDeserialize::from_toml_str(&contents)?;
        config.apply_env(|key| std::env::var(key).ok());
        AppConfig::new(config)
    }

    pub fn realm(&self) -> &str {
        &self.trust.realm
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    #[cfg(test)]
    pub fn new_test() -> Self {
        let config = AppConfigDeserialize::from_toml_str(
            r#"
environment = "development"
listen_address = "127.0.0.1:0"

[wsfed]
realm = "https://webapp.example.com/"
metadata = "https://adfs.example.com/FederationMetadata/2007-06/FederationMetadata.xml"
reply_url = "https://webapp.example.com/signin-wsfed"
        "#,
        )
        .expect("test config to be valid toml");
        Self::new(config).expect("test config to be complete")
    }
}
