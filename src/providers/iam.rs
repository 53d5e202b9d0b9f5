use anyhow::{Context, Result};
use aws_config::Region;
use aws_sdk_iam::config::Credentials;
use aws_sdk_iam::primitives::DateTime as AwsDateTime;
use aws_sdk_iam::types::AccessKeyMetadata;
use aws_sdk_iam::Client as IamClient;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::key_provider::{AccessKeyInfo, KeyProvider, NewAccessKey};
use crate::config::AwsClientConfig;

const CREDENTIALS_PROVIDER_NAME: &str = "aws-key-rotator-config";

/// AWS IAM access key provider
pub struct IamKeyProvider {
    client: IamClient,
}

impl IamKeyProvider {
    /// Create an IAM client authenticated with the key set's current credentials
    pub async fn new(config: &AwsClientConfig) -> Result<Self> {
        let credentials = Credentials::new(
            config.credentials.key.clone(),
            config.credentials.secret.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER_NAME,
        );

        // Static credentials from the config file take precedence over the
        // environment so each key set authenticates as itself
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(ref endpoint) = config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        debug!(
            "Created IAM client in region {} (endpoint {})",
            config.region,
            config.endpoint.as_deref().unwrap_or("default")
        );

        Ok(Self {
            client: IamClient::new(&sdk_config),
        })
    }
}

fn to_chrono(date: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(date.secs(), date.subsec_nanos())
}

fn to_access_key_info(metadata: &AccessKeyMetadata) -> Result<AccessKeyInfo> {
    let access_key_id = metadata
        .access_key_id()
        .context("IAM returned an access key without an id")?;
    let created_at = metadata
        .create_date()
        .and_then(to_chrono)
        .with_context(|| format!("Access key {} has no valid creation date", access_key_id))?;

    Ok(AccessKeyInfo {
        access_key_id: access_key_id.to_string(),
        created_at,
    })
}

#[async_trait::async_trait]
impl KeyProvider for IamKeyProvider {
    async fn list_access_keys(&self, user: &str) -> Result<Vec<AccessKeyInfo>> {
        debug!("Listing access keys for IAM user: {}", user);

        let response = self
            .client
            .list_access_keys()
            .user_name(user)
            .send()
            .await
            .with_context(|| format!("Failed to list access keys for IAM user '{}'", user))?;

        response
            .access_key_metadata()
            .iter()
            .map(to_access_key_info)
            .collect()
    }

    async fn create_access_key(&self, user: &str) -> Result<NewAccessKey> {
        debug!("Creating access key for IAM user: {}", user);

        let response = self
            .client
            .create_access_key()
            .user_name(user)
            .send()
            .await
            .with_context(|| format!("Failed to create access key for IAM user '{}'", user))?;

        let key = response
            .access_key()
            .with_context(|| format!("IAM returned no access key for user '{}'", user))?;

        info!(
            "Created access key {} for IAM user '{}'",
            key.access_key_id(),
            user
        );

        Ok(NewAccessKey {
            access_key_id: key.access_key_id().to_string(),
            secret_access_key: key.secret_access_key().to_string(),
        })
    }

    async fn delete_access_key(&self, user: &str, access_key_id: &str) -> Result<()> {
        debug!("Deleting access key {} for IAM user: {}", access_key_id, user);

        self.client
            .delete_access_key()
            .user_name(user)
            .access_key_id(access_key_id)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to delete access key {} for IAM user '{}'",
                    access_key_id, user
                )
            })?;

        info!("Deleted access key {} for IAM user '{}'", access_key_id, user);
        Ok(())
    }

    fn provider_type(&self) -> &'static str {
        "AWS IAM"
    }
}
