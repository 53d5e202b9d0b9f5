use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use crate::config::{Config, ConfigStore, Destination, KeySetConfig};
use crate::destinations::SecretStore;
use crate::error::RotateError;
use crate::providers::{AccessKeyInfo, KeyProvider, NewAccessKey, ProviderFactory};

/// Knobs for a rotation run
#[derive(Debug, Clone, Copy)]
pub struct RotationOptions {
    /// Only report what would be rotated
    pub dry_run: bool,
    /// Reference time for key age checks
    pub now: DateTime<Utc>,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            now: Utc::now(),
        }
    }
}

/// What happened to a single key set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySetOutcome {
    /// The current key is younger than the maximum age
    Skipped { access_key_id: String, age: Duration },
    /// Dry run: the key is due
    WouldRotate { access_key_id: String, age: Duration },
    Rotated {
        old_access_key_id: String,
        new_access_key_id: String,
        destinations: usize,
    },
}

#[derive(Debug)]
pub struct KeySetReport {
    pub name: String,
    pub outcome: Result<KeySetOutcome>,
}

/// Outcome of a full run over every configured key set
#[derive(Debug, Default)]
pub struct RotationReport {
    pub key_sets: Vec<KeySetReport>,
}

impl RotationReport {
    pub fn has_failures(&self) -> bool {
        self.key_sets.iter().any(|r| r.outcome.is_err())
    }

    pub fn rotated(&self) -> usize {
        self.key_sets
            .iter()
            .filter(|r| matches!(r.outcome, Ok(KeySetOutcome::Rotated { .. })))
            .count()
    }
}

/// Current key state of a key set, as shown by `check`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    pub user: String,
    pub keys: Vec<AccessKeyInfo>,
    pub max_age: Duration,
    pub due: bool,
}

/// A key is due once it is strictly older than `max_age`
pub fn needs_rotation(created_at: DateTime<Utc>, max_age: Duration, now: DateTime<Utc>) -> bool {
    // No representable key can be older than an age reaching past the calendar
    now.checked_sub_signed(max_age)
        .is_some_and(|threshold| threshold > created_at)
}

/// Fetch the user's single access key; any other count means a previous run
/// was interrupted and needs manual recovery
async fn current_key(provider: &dyn KeyProvider, user: &str) -> Result<AccessKeyInfo> {
    let mut keys = provider
        .list_access_keys(user)
        .await
        .context("Failed to list access keys")?;

    if keys.len() != 1 {
        return Err(RotateError::UnexpectedKeyCount {
            user: user.to_string(),
            count: keys.len(),
        }
        .into());
    }

    Ok(keys.remove(0))
}

/// Rotate one key set: create, persist, distribute and only then delete
pub async fn rotate_key_set(
    name: &str,
    config: &mut Config,
    provider: &dyn KeyProvider,
    store: &dyn SecretStore,
    config_store: &dyn ConfigStore,
    options: RotationOptions,
) -> Result<KeySetOutcome> {
    let key_set: KeySetConfig = config
        .keys
        .get(name)
        .cloned()
        .with_context(|| format!("Unknown key set '{}'", name))?;
    let user = key_set.aws.user.as_str();
    let max_age = key_set.aws.max_key_age()?;

    info!(
        "Checking key set '{}' (user {} via {})",
        name,
        user,
        provider.provider_type()
    );

    let old_key = current_key(provider, user).await?;
    let age = options.now - old_key.created_at;

    if !needs_rotation(old_key.created_at, max_age, options.now) {
        info!(
            "Key {} for '{}' is {} day(s) old, not due yet",
            old_key.access_key_id,
            user,
            age.num_days()
        );
        return Ok(KeySetOutcome::Skipped {
            access_key_id: old_key.access_key_id,
            age,
        });
    }

    if options.dry_run {
        info!(
            "[DRY RUN] Would rotate key {} for '{}' ({} day(s) old)",
            old_key.access_key_id,
            user,
            age.num_days()
        );
        return Ok(KeySetOutcome::WouldRotate {
            access_key_id: old_key.access_key_id,
            age,
        });
    }

    let new_key = provider
        .create_access_key(user)
        .await
        .context("Failed to create replacement access key")?;

    persist_new_key(name, config, config_store, &key_set, &new_key)?;

    let failed = propagate(store, &key_set, &new_key).await;
    if !failed.is_empty() {
        warn!(
            "Keeping old key {} for '{}' because {} destination(s) were not updated",
            old_key.access_key_id,
            user,
            failed.len()
        );
        return Err(RotateError::PropagationFailed { failed }.into());
    }

    provider
        .delete_access_key(user, &old_key.access_key_id)
        .await
        .map_err(|e| RotateError::DeleteFailed {
            access_key_id: old_key.access_key_id.clone(),
            reason: format!("{:#}", e),
        })?;

    info!(
        "Rotated key set '{}': {} -> {}",
        name, old_key.access_key_id, new_key.access_key_id
    );

    Ok(KeySetOutcome::Rotated {
        old_access_key_id: old_key.access_key_id,
        new_access_key_id: new_key.access_key_id,
        destinations: key_set.key_destinations.len() + key_set.secret_destinations.len(),
    })
}

/// Write the new credentials to the config; on failure the in-memory config
/// keeps the previous (still valid) credentials
fn persist_new_key(
    name: &str,
    config: &mut Config,
    config_store: &dyn ConfigStore,
    key_set: &KeySetConfig,
    new_key: &NewAccessKey,
) -> Result<()> {
    config.set_credentials(name, &new_key.access_key_id, &new_key.secret_access_key)?;

    if let Err(e) = config_store.save(config) {
        let previous = &key_set.aws.config.credentials;
        config.set_credentials(name, &previous.key, &previous.secret)?;
        error!(
            "New access key {} for '{}' could not be saved; it exists in IAM but is not recorded",
            new_key.access_key_id, key_set.aws.user
        );
        return Err(RotateError::PersistFailed {
            access_key_id: new_key.access_key_id.clone(),
            reason: format!("{:#}", e),
        }
        .into());
    }

    Ok(())
}

/// Push the key id and secret to every destination, attempting all of them.
/// Returns the destinations that failed.
async fn propagate(
    store: &dyn SecretStore,
    key_set: &KeySetConfig,
    new_key: &NewAccessKey,
) -> Vec<String> {
    let writes = key_set
        .key_destinations
        .iter()
        .map(|d| (d, new_key.access_key_id.as_str()))
        .chain(
            key_set
                .secret_destinations
                .iter()
                .map(|d| (d, new_key.secret_access_key.as_str())),
        );

    let mut failed = Vec::new();
    for (destination, value) in writes {
        if let Err(e) = set_one(store, destination, value).await {
            error!("✗ {}: {:#}", destination, e);
            failed.push(destination.to_string());
        }
    }
    failed
}

async fn set_one(store: &dyn SecretStore, destination: &Destination, value: &str) -> Result<()> {
    store
        .set_secret(destination, value)
        .await
        .with_context(|| format!("Failed to update {} in {}", destination, store.store_type()))
}

/// Rotate every key set in config order. A failing set does not stop the
/// ones after it.
pub async fn rotate_all(
    config: &mut Config,
    factory: &dyn ProviderFactory,
    store: &dyn SecretStore,
    config_store: &dyn ConfigStore,
    options: RotationOptions,
) -> RotationReport {
    let names: Vec<String> = config.keys.keys().cloned().collect();
    let mut report = RotationReport::default();

    for name in names {
        let outcome = rotate_named(&name, config, factory, store, config_store, options).await;
        if let Err(ref e) = outcome {
            error!("✗ Key set '{}' failed: {:#}", name, e);
        }
        report.key_sets.push(KeySetReport { name, outcome });
    }

    report
}

async fn rotate_named(
    name: &str,
    config: &mut Config,
    factory: &dyn ProviderFactory,
    store: &dyn SecretStore,
    config_store: &dyn ConfigStore,
    options: RotationOptions,
) -> Result<KeySetOutcome> {
    let client_config = config
        .keys
        .get(name)
        .map(|k| k.aws.config.clone())
        .with_context(|| format!("Unknown key set '{}'", name))?;
    let provider = factory
        .provider_for(&client_config)
        .await
        .with_context(|| format!("Failed to create key provider for '{}'", name))?;

    rotate_key_set(name, config, provider.as_ref(), store, config_store, options).await
}

/// Report key ages without changing anything
pub async fn inspect(
    config: &Config,
    factory: &dyn ProviderFactory,
    now: DateTime<Utc>,
) -> Vec<(String, Result<KeyStatus>)> {
    let mut statuses = Vec::new();

    for (name, key_set) in &config.keys {
        let status = async {
            let max_age = key_set.aws.max_key_age()?;
            let provider = factory.provider_for(&key_set.aws.config).await?;
            let keys = provider
                .list_access_keys(&key_set.aws.user)
                .await
                .context("Failed to list access keys")?;
            let due = keys.len() == 1 && needs_rotation(keys[0].created_at, max_age, now);

            Ok::<_, anyhow::Error>(KeyStatus {
                user: key_set.aws.user.clone(),
                keys,
                max_age,
                due,
            })
        }
        .await;

        statuses.push((name.clone(), status));
    }

    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Provider;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const CONFIG: &str = r#"
github:
  token: ghp_real
keys:
  prod:
    aws:
      user: deployer
      maxKeyAge: P7D
      config:
        region: eu-west-1
        credentials:
          key: AKIAOLD
          secret: old-secret
    keyDestinations:
      - { owner: acme, repo: api, key: AWS_ACCESS_KEY_ID }
      - { owner: acme, repo: web, key: AWS_ACCESS_KEY_ID }
    secretDestinations:
      - { owner: acme, repo: api, key: AWS_SECRET_ACCESS_KEY }
"#;

    #[derive(Default)]
    struct IamState {
        keys: HashMap<String, Vec<AccessKeyInfo>>,
        created: usize,
        deleted: Vec<String>,
        fail_delete: bool,
    }

    #[derive(Clone, Default)]
    struct FakeIam(Arc<Mutex<IamState>>);

    impl FakeIam {
        fn with_key(user: &str, id: &str, created_at: DateTime<Utc>) -> Self {
            let fake = Self::default();
            fake.0.lock().unwrap().keys.insert(
                user.to_string(),
                vec![AccessKeyInfo {
                    access_key_id: id.to_string(),
                    created_at,
                }],
            );
            fake
        }

        fn key_ids(&self, user: &str) -> Vec<String> {
            self.0.lock().unwrap().keys[user]
                .iter()
                .map(|k| k.access_key_id.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl KeyProvider for FakeIam {
        async fn list_access_keys(&self, user: &str) -> Result<Vec<AccessKeyInfo>> {
            Ok(self.0.lock().unwrap().keys.get(user).cloned().unwrap_or_default())
        }

        async fn create_access_key(&self, user: &str) -> Result<NewAccessKey> {
            let mut state = self.0.lock().unwrap();
            state.created += 1;
            let key = NewAccessKey {
                access_key_id: format!("AKIANEW{}", state.created),
                secret_access_key: format!("new-secret-{}", state.created),
            };
            state.keys.entry(user.to_string()).or_default().push(AccessKeyInfo {
                access_key_id: key.access_key_id.clone(),
                created_at: Utc::now(),
            });
            Ok(key)
        }

        async fn delete_access_key(&self, user: &str, access_key_id: &str) -> Result<()> {
            let mut state = self.0.lock().unwrap();
            if state.fail_delete {
                anyhow::bail!("AccessDenied");
            }
            state.deleted.push(access_key_id.to_string());
            if let Some(keys) = state.keys.get_mut(user) {
                keys.retain(|k| k.access_key_id != access_key_id);
            }
            Ok(())
        }

        fn provider_type(&self) -> &'static str {
            "fake"
        }
    }

    #[async_trait::async_trait]
    impl ProviderFactory for FakeIam {
        async fn provider_for(&self, _config: &crate::config::AwsClientConfig) -> Result<Provider> {
            Ok(Box::new(self.clone()))
        }
    }

    #[derive(Default)]
    struct FakeStore {
        written: Mutex<Vec<(String, String)>>,
        failing: Vec<String>,
    }

    #[async_trait::async_trait]
    impl SecretStore for FakeStore {
        async fn set_secret(&self, destination: &Destination, value: &str) -> Result<()> {
            let name = destination.to_string();
            if self.failing.contains(&name) {
                anyhow::bail!("forbidden");
            }
            self.written.lock().unwrap().push((name, value.to_string()));
            Ok(())
        }

        fn store_type(&self) -> &'static str {
            "fake"
        }
    }

    #[derive(Default)]
    struct MemoryConfigStore {
        saved: Mutex<Vec<Config>>,
        fail: bool,
    }

    impl ConfigStore for MemoryConfigStore {
        fn save(&self, config: &Config) -> Result<()> {
            if self.fail {
                anyhow::bail!("read-only file system");
            }
            self.saved.lock().unwrap().push(config.clone());
            Ok(())
        }
    }

    fn old_date() -> DateTime<Utc> {
        Utc::now() - Duration::days(10)
    }

    #[test]
    fn test_needs_rotation_boundary() {
        let now = Utc::now();
        let max_age = Duration::days(7);
        assert!(!needs_rotation(now - Duration::days(7), max_age, now));
        assert!(needs_rotation(
            now - Duration::days(7) - Duration::seconds(1),
            max_age,
            now
        ));
        assert!(!needs_rotation(now, max_age, now));
    }

    #[test]
    fn test_needs_rotation_with_age_beyond_calendar() {
        let now = Utc::now();
        let max_age = Duration::days(365 * 300_000);
        assert!(!needs_rotation(now - Duration::days(3650), max_age, now));
    }

    #[tokio::test]
    async fn test_rotates_old_key() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        let iam = FakeIam::with_key("deployer", "AKIAOLD", old_date());
        let store = FakeStore::default();
        let config_store = MemoryConfigStore::default();

        let outcome = rotate_key_set(
            "prod",
            &mut config,
            &iam,
            &store,
            &config_store,
            RotationOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            KeySetOutcome::Rotated {
                old_access_key_id: "AKIAOLD".to_string(),
                new_access_key_id: "AKIANEW1".to_string(),
                destinations: 3,
            }
        );

        let written = store.written.lock().unwrap().clone();
        assert_eq!(
            written,
            vec![
                ("acme/api:AWS_ACCESS_KEY_ID".to_string(), "AKIANEW1".to_string()),
                ("acme/web:AWS_ACCESS_KEY_ID".to_string(), "AKIANEW1".to_string()),
                (
                    "acme/api:AWS_SECRET_ACCESS_KEY".to_string(),
                    "new-secret-1".to_string()
                ),
            ]
        );

        let saved = config_store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].keys["prod"].aws.config.credentials.key, "AKIANEW1");
        assert_eq!(
            saved[0].keys["prod"].aws.config.credentials.secret,
            "new-secret-1"
        );
        assert_eq!(iam.key_ids("deployer"), vec!["AKIANEW1".to_string()]);
    }

    #[tokio::test]
    async fn test_young_key_is_skipped() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        let iam = FakeIam::with_key("deployer", "AKIAOLD", Utc::now() - Duration::days(2));
        let store = FakeStore::default();
        let config_store = MemoryConfigStore::default();

        let outcome = rotate_key_set(
            "prod",
            &mut config,
            &iam,
            &store,
            &config_store,
            RotationOptions::default(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, KeySetOutcome::Skipped { .. }));
        assert_eq!(iam.0.lock().unwrap().created, 0);
        assert!(store.written.lock().unwrap().is_empty());
        assert!(config_store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        let iam = FakeIam::with_key("deployer", "AKIAOLD", old_date());
        let store = FakeStore::default();
        let config_store = MemoryConfigStore::default();

        let outcome = rotate_key_set(
            "prod",
            &mut config,
            &iam,
            &store,
            &config_store,
            RotationOptions {
                dry_run: true,
                now: Utc::now(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(outcome, KeySetOutcome::WouldRotate { .. }));
        assert_eq!(iam.key_ids("deployer"), vec!["AKIAOLD".to_string()]);
        assert!(config_store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_keys_bails_without_changes() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        let iam = FakeIam::with_key("deployer", "AKIAOLD", old_date());
        iam.0.lock().unwrap().keys.get_mut("deployer").unwrap().push(AccessKeyInfo {
            access_key_id: "AKIAOTHER".to_string(),
            created_at: old_date(),
        });
        let store = FakeStore::default();
        let config_store = MemoryConfigStore::default();

        let err = rotate_key_set(
            "prod",
            &mut config,
            &iam,
            &store,
            &config_store,
            RotationOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<RotateError>(),
            Some(RotateError::UnexpectedKeyCount { count: 2, .. })
        ));
        assert_eq!(iam.0.lock().unwrap().created, 0);
    }

    #[tokio::test]
    async fn test_no_keys_bails() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        let iam = FakeIam::default();
        let store = FakeStore::default();
        let config_store = MemoryConfigStore::default();

        let err = rotate_key_set(
            "prod",
            &mut config,
            &iam,
            &store,
            &config_store,
            RotationOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<RotateError>(),
            Some(RotateError::UnexpectedKeyCount { count: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_old_key_and_skips_destinations() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        let iam = FakeIam::with_key("deployer", "AKIAOLD", old_date());
        let store = FakeStore::default();
        let config_store = MemoryConfigStore {
            fail: true,
            ..Default::default()
        };

        let err = rotate_key_set(
            "prod",
            &mut config,
            &iam,
            &store,
            &config_store,
            RotationOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<RotateError>(),
            Some(RotateError::PersistFailed { .. })
        ));
        assert!(store.written.lock().unwrap().is_empty());
        assert!(iam.0.lock().unwrap().deleted.is_empty());
        assert_eq!(config.keys["prod"].aws.config.credentials.key, "AKIAOLD");
    }

    #[tokio::test]
    async fn test_destination_failure_keeps_old_key() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        let iam = FakeIam::with_key("deployer", "AKIAOLD", old_date());
        let store = FakeStore {
            failing: vec!["acme/web:AWS_ACCESS_KEY_ID".to_string()],
            ..Default::default()
        };
        let config_store = MemoryConfigStore::default();

        let err = rotate_key_set(
            "prod",
            &mut config,
            &iam,
            &store,
            &config_store,
            RotationOptions::default(),
        )
        .await
        .unwrap_err();

        match err.downcast_ref::<RotateError>() {
            Some(RotateError::PropagationFailed { failed }) => {
                assert_eq!(failed, &vec!["acme/web:AWS_ACCESS_KEY_ID".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Later destinations are still attempted
        assert_eq!(store.written.lock().unwrap().len(), 2);
        assert!(iam.0.lock().unwrap().deleted.is_empty());
        assert_eq!(
            iam.key_ids("deployer"),
            vec!["AKIAOLD".to_string(), "AKIANEW1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_failure_is_reported() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        let iam = FakeIam::with_key("deployer", "AKIAOLD", old_date());
        iam.0.lock().unwrap().fail_delete = true;
        let store = FakeStore::default();
        let config_store = MemoryConfigStore::default();

        let err = rotate_key_set(
            "prod",
            &mut config,
            &iam,
            &store,
            &config_store,
            RotationOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<RotateError>(),
            Some(RotateError::DeleteFailed { access_key_id, .. }) if access_key_id == "AKIAOLD"
        ));
        assert_eq!(store.written.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rotate_all_continues_after_failure() {
        let yaml = format!(
            "{}  broken:\n    aws:\n      user: nobody\n      config:\n        region: eu-west-1\n        credentials:\n          key: AKIAX\n          secret: x\n",
            CONFIG
        );
        let mut config = Config::from_yaml(&yaml).unwrap();
        // A failing set ahead of a healthy one
        config.keys.move_index(1, 0);

        let iam = FakeIam::with_key("deployer", "AKIAOLD", old_date());
        let store = FakeStore::default();
        let config_store = MemoryConfigStore::default();

        let report = rotate_all(
            &mut config,
            &iam,
            &store,
            &config_store,
            RotationOptions::default(),
        )
        .await;

        assert_eq!(report.key_sets.len(), 2);
        assert_eq!(report.key_sets[0].name, "broken");
        assert!(report.key_sets[0].outcome.is_err());
        assert_eq!(report.key_sets[1].name, "prod");
        assert!(report.key_sets[1].outcome.is_ok());
        assert!(report.has_failures());
        assert_eq!(report.rotated(), 1);
    }

    #[tokio::test]
    async fn test_inspect_reports_due_keys() {
        let config = Config::from_yaml(CONFIG).unwrap();
        let iam = FakeIam::with_key("deployer", "AKIAOLD", old_date());

        let statuses = inspect(&config, &iam, Utc::now()).await;

        assert_eq!(statuses.len(), 1);
        let (name, status) = &statuses[0];
        assert_eq!(name, "prod");
        let status = status.as_ref().unwrap();
        assert!(status.due);
        assert_eq!(status.max_age, Duration::days(7));
        assert_eq!(status.keys.len(), 1);
    }
}
