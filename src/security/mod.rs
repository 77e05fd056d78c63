//! Secure storage for the proposer API key

pub mod keyring;

pub use self::keyring::{get_api_key, has_api_key, set_api_key};
