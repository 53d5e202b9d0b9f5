//! Secret destinations
//!
//! Destinations receive the new access key id or secret access key once a key
//! has been rotated.

mod github;
mod secret_store;

pub use github::{seal_secret, GithubSecrets, RepositoryPublicKey};
pub use secret_store::SecretStore;
