use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crypto_box::{PublicKey, KEY_SIZE};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{Destination, GithubConfig};
use crate::destinations::secret_store::SecretStore;

const GITHUB_API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Public key GitHub uses to encrypt Actions secrets for one repository
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositoryPublicKey {
    pub key_id: String,
    /// Base64 encoded X25519 public key
    pub key: String,
}

#[derive(Debug, Serialize)]
struct PutSecretRequest<'a> {
    encrypted_value: &'a str,
    key_id: &'a str,
}

/// GitHub Actions repository secrets over the REST API
pub struct GithubSecrets {
    client: Client,
    base_url: String,
    /// Public keys by `owner/repo`, fetched once per run
    public_keys: Mutex<HashMap<String, RepositoryPublicKey>>,
}

impl GithubSecrets {
    /// Create a new client authenticated with the configured token
    pub fn new(config: &GithubConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .context("GitHub token contains invalid header characters")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static(GITHUB_API_VERSION),
        );

        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_url().trim_end_matches('/').to_string(),
            public_keys: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Fetch (or reuse) the repository's secrets public key
    pub async fn repository_public_key(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<RepositoryPublicKey> {
        let cache_key = format!("{}/{}", owner, repo);

        let cached = self
            .public_keys
            .lock()
            .map_err(|_| anyhow!("Public key cache lock poisoned"))?
            .get(&cache_key)
            .cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let url = self.url(&format!("repos/{}/{}/actions/secrets/public-key", owner, repo));
        debug!("Fetching secrets public key: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch public key for {}", cache_key))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!(
                "Fetching public key for {} failed with status {}: {}",
                cache_key,
                status,
                error_text
            );
        }

        let public_key: RepositoryPublicKey = response
            .json()
            .await
            .with_context(|| format!("Invalid public key response for {}", cache_key))?;

        self.public_keys
            .lock()
            .map_err(|_| anyhow!("Public key cache lock poisoned"))?
            .insert(cache_key, public_key.clone());

        Ok(public_key)
    }
}

/// Encrypt a value as a libsodium sealed box for the given base64 public key.
/// Returns the base64 encoded ciphertext GitHub expects.
pub fn seal_secret(public_key: &str, value: &str) -> Result<String> {
    let raw = BASE64
        .decode(public_key.trim())
        .context("Repository public key is not valid base64")?;
    let bytes: [u8; KEY_SIZE] = raw.as_slice().try_into().map_err(|_| {
        anyhow!(
            "Repository public key must be {} bytes, got {}",
            KEY_SIZE,
            raw.len()
        )
    })?;

    let sealed = PublicKey::from(bytes)
        .seal(&mut rand::thread_rng(), value.as_bytes())
        .map_err(|_| anyhow!("Failed to encrypt secret value"))?;

    Ok(BASE64.encode(sealed))
}

#[async_trait::async_trait]
impl SecretStore for GithubSecrets {
    async fn set_secret(&self, destination: &Destination, value: &str) -> Result<()> {
        let public_key = self
            .repository_public_key(&destination.owner, &destination.repo)
            .await?;
        let encrypted_value = seal_secret(&public_key.key, value)
            .with_context(|| format!("Failed to encrypt secret for {}", destination))?;

        let url = self.url(&format!(
            "repos/{}/{}/actions/secrets/{}",
            destination.owner, destination.repo, destination.key
        ));
        debug!("Writing secret: {}", url);

        let response = self
            .client
            .put(&url)
            .json(&PutSecretRequest {
                encrypted_value: &encrypted_value,
                key_id: &public_key.key_id,
            })
            .send()
            .await
            .with_context(|| format!("Failed to send secret for {}", destination))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!(
                "Setting secret {} failed with status {}: {}",
                destination,
                status,
                error_text
            );
        }

        info!("Updated GitHub secret {}", destination);
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "GitHub Actions secrets"
    }
}
