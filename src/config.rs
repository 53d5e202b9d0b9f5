use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::duration;
use crate::error::RotateError;

/// Config file looked up when none is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "rotate.yml";

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

const PLACEHOLDER_TOKEN: &str = "token-here";
const PLACEHOLDER_KEY: &str = "key";
const PLACEHOLDER_SECRET: &str = "secret";

/// Keys this tool doesn't interpret; written back unchanged
pub type Extra = IndexMap<String, serde_yaml::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub github: GithubConfig,
    /// Key sets, rotated in file order
    pub keys: IndexMap<String, KeySetConfig>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubConfig {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl GithubConfig {
    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(DEFAULT_GITHUB_API_URL)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySetConfig {
    pub aws: AwsConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_destinations: Vec<Destination>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_destinations: Vec<Destination>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsConfig {
    /// IAM user whose access key is rotated
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_key_age: Option<String>,
    pub config: AwsClientConfig,
    #[serde(flatten)]
    pub extra: Extra,
}

impl AwsConfig {
    pub fn max_key_age(&self) -> Result<chrono::Duration, RotateError> {
        duration::max_key_age(self.max_key_age.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsClientConfig {
    pub region: String,
    /// Informational; the SDK has no API version selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Custom IAM endpoint, e.g. a local emulator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub credentials: AwsCredentials,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub key: String,
    pub secret: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A GitHub repository secret that receives one half of the credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub owner: String,
    pub repo: String,
    pub key: String,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.owner, self.repo, self.key)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("Invalid YAML configuration")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }

    /// Write the configuration back to disk.
    ///
    /// The file is replaced via rename so readers never observe a partial write.
    /// An existing file keeps its permissions; a new one is created owner-only.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let yaml = self.to_yaml()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        tmp.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp.path().display()))?;

        if let Ok(metadata) = fs::metadata(path) {
            tmp.as_file()
                .set_permissions(metadata.permissions())
                .with_context(|| format!("Failed to copy permissions of {}", path.display()))?;
        }
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("Failed to flush {}", tmp.path().display()))?;

        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Reject configurations that still look like the generated sample
    pub fn validate(&self) -> Result<(), RotateError> {
        if self.github.token.trim().is_empty() || self.github.token == PLACEHOLDER_TOKEN {
            return Err(RotateError::PlaceholderConfig("github.token".to_string()));
        }

        if self.keys.is_empty() {
            return Err(RotateError::PlaceholderConfig(
                "no key sets under 'keys'".to_string(),
            ));
        }

        for (name, key_set) in &self.keys {
            let credentials = &key_set.aws.config.credentials;
            if key_set.aws.user.trim().is_empty() {
                return Err(RotateError::PlaceholderConfig(format!(
                    "keys.{}.aws.user is empty",
                    name
                )));
            }
            if credentials.key == PLACEHOLDER_KEY || credentials.secret == PLACEHOLDER_SECRET {
                return Err(RotateError::PlaceholderConfig(format!(
                    "keys.{}.aws.config.credentials",
                    name
                )));
            }
            key_set.aws.max_key_age()?;
        }

        Ok(())
    }

    /// Store freshly issued credentials for a key set
    pub fn set_credentials(&mut self, key_set: &str, key: &str, secret: &str) -> Result<()> {
        let entry = self
            .keys
            .get_mut(key_set)
            .with_context(|| format!("Unknown key set '{}'", key_set))?;
        let credentials = &mut entry.aws.config.credentials;
        credentials.key = key.to_string();
        credentials.secret = secret.to_string();
        Ok(())
    }

    /// The configuration printed when no config file exists yet
    pub fn sample() -> Self {
        let mut keys = IndexMap::new();
        keys.insert(
            "int".to_string(),
            KeySetConfig {
                aws: AwsConfig {
                    user: "ofr-automation".to_string(),
                    max_key_age: Some(duration::DEFAULT_MAX_KEY_AGE.to_string()),
                    config: AwsClientConfig {
                        region: "eu-west-2".to_string(),
                        version: Some("latest".to_string()),
                        endpoint: None,
                        credentials: AwsCredentials {
                            key: PLACEHOLDER_KEY.to_string(),
                            secret: PLACEHOLDER_SECRET.to_string(),
                            extra: Extra::new(),
                        },
                        extra: Extra::new(),
                    },
                    extra: Extra::new(),
                },
                key_destinations: vec![Destination {
                    owner: "owner".to_string(),
                    repo: "repo".to_string(),
                    key: "AWS_ACCESS_KEY_ID".to_string(),
                }],
                secret_destinations: vec![Destination {
                    owner: "owner".to_string(),
                    repo: "repo".to_string(),
                    key: "AWS_SECRET_ACCESS_KEY".to_string(),
                }],
                extra: Extra::new(),
            },
        );

        Self {
            github: GithubConfig {
                token: PLACEHOLDER_TOKEN.to_string(),
                api_url: None,
                extra: Extra::new(),
            },
            keys,
            extra: Extra::new(),
        }
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let yaml = Self::sample()
            .to_yaml()
            .context("Failed to serialize sample config")?;
        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write sample config to {:?}", path.as_ref()))?;

        Ok(())
    }
}

/// Relative paths are taken from the working directory, absolute ones as-is
pub fn resolve_config_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Where rotated credentials are written back to
pub trait ConfigStore {
    fn save(&self, config: &Config) -> Result<()>;
}

/// Persists the configuration to the YAML file it was loaded from
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigStore for FileConfigStore {
    fn save(&self, config: &Config) -> Result<()> {
        config.save(&self.path)
    }
}
