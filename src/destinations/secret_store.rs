use anyhow::Result;

use crate::config::Destination;

/// Trait for places rotated credentials are published to (GitHub Actions secrets, fakes in tests)
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Create or overwrite a secret at the destination
    async fn set_secret(&self, destination: &Destination, value: &str) -> Result<()>;

    /// Get the store name for display purposes
    fn store_type(&self) -> &'static str;
}
