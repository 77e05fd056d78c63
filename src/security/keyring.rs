//! Keyring integration for the proposer API key
//! Falls back to file storage if keyring is unavailable

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

const SERVICE_NAME: &str = "creative-evolve";
const API_KEY_USERNAME: &str = "openrouter-api-key";
const API_KEY_FILE: &str = "api_key.txt";

/// Environment variable that overrides both keyring and file
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

fn api_key_file_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "creative-evolve", "creative-evolve")
        .context("Failed to get project directories")?;
    let dir = base.config_dir();
    fs::create_dir_all(dir).context("Failed to create config directory")?;
    Ok(dir.join(API_KEY_FILE))
}

/// Set API key - tries keyring first, falls back to file
pub fn set_api_key(key: &str) -> Result<()> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, API_KEY_USERNAME) {
        if entry.set_password(key).is_ok() {
            return Ok(());
        }
    }

    save_to_file(key)?;
    tracing::warn!("Keyring unavailable, API key stored in file");
    Ok(())
}

fn save_to_file(key: &str) -> Result<()> {
    let path = api_key_file_path()?;
    fs::write(&path, key).context("Failed to write API key file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .context("Failed to set file permissions")?;
    }

    Ok(())
}

/// Get API key - environment, then keyring, then file
pub fn get_api_key() -> Result<String> {
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.trim().is_empty() {
            return Ok(key.trim().to_string());
        }
    }

    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, API_KEY_USERNAME) {
        if let Ok(key) = entry.get_password() {
            return Ok(key);
        }
    }

    let path = api_key_file_path()?;
    let key = fs::read_to_string(&path)
        .context("Failed to read API key. Run 'creative-evolve config --set-api-key YOUR_KEY' first.")?;
    Ok(key.trim().to_string())
}

/// Check if an API key is available from any source
pub fn has_api_key() -> bool {
    if std::env::var(API_KEY_ENV).map_or(false, |k| !k.trim().is_empty()) {
        return true;
    }

    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, API_KEY_USERNAME) {
        if entry.get_password().is_ok() {
            return true;
        }
    }

    api_key_file_path().map_or(false, |p| p.exists())
}
