use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;

/// Metadata of an existing access key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyInfo {
    pub access_key_id: String,
    pub created_at: DateTime<Utc>,
}

/// A freshly issued access key, including its secret half
#[derive(Clone, PartialEq, Eq)]
pub struct NewAccessKey {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for NewAccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAccessKey")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Trait for systems that issue access keys for a user (AWS IAM, fakes in tests)
#[async_trait::async_trait]
pub trait KeyProvider: Send + Sync {
    /// List the access keys currently attached to a user
    async fn list_access_keys(&self, user: &str) -> Result<Vec<AccessKeyInfo>>;

    /// Issue a new access key for a user
    async fn create_access_key(&self, user: &str) -> Result<NewAccessKey>;

    /// Delete an access key
    async fn delete_access_key(&self, user: &str, access_key_id: &str) -> Result<()>;

    /// Get the provider name for display purposes
    fn provider_type(&self) -> &'static str;
}
