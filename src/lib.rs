//! AWS Key Rotator Library
//!
//! Rotates AWS IAM access keys and propagates the new credentials to GitHub
//! Actions repository secrets before retiring the old key.

pub mod cli;
pub mod config;
pub mod destinations;
pub mod duration;
pub mod error;
pub mod providers;
pub mod rotation;

pub use config::Config;
pub use error::RotateError;
pub use rotation::{inspect, needs_rotation, rotate_all, rotate_key_set};
