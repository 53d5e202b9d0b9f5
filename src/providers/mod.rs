//! Access key providers
//!
//! A provider owns the lifecycle of a user's access keys: listing, issuing and
//! deleting them.

mod iam;
mod key_provider;

use anyhow::Result;

use crate::config::AwsClientConfig;

pub use iam::IamKeyProvider;
pub use key_provider::{AccessKeyInfo, KeyProvider, NewAccessKey};

/// Type alias for provider trait object
pub type Provider = Box<dyn KeyProvider>;

/// Builds a provider authenticated for one key set
#[async_trait::async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn provider_for(&self, config: &AwsClientConfig) -> Result<Provider>;
}

/// Creates AWS IAM clients from the key set's region and credentials
pub struct IamProviderFactory;

#[async_trait::async_trait]
impl ProviderFactory for IamProviderFactory {
    async fn provider_for(&self, config: &AwsClientConfig) -> Result<Provider> {
        Ok(Box::new(IamKeyProvider::new(config).await?))
    }
}
