// dbtunnel - Profile Manager Module
// Profile I/O shared by the CLI and the connection manager

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::app_config_dir;
use crate::error::Error;
use crate::Profile;

/// Get the profiles directory path
pub fn profiles_dir() -> Result<PathBuf> {
    Ok(app_config_dir()?.join("profiles"))
}

/// Reject names that would escape the profiles directory
fn check_profile_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('.')
        || trimmed.contains('/')
        || trimmed.contains('\\')
    {
        return Err(Error::Config(format!("Invalid profile name: '{}'", name)).into());
    }
    Ok(())
}

fn profile_path_in(dir: &Path, name: &str) -> Result<PathBuf> {
    check_profile_name(name)?;
    Ok(dir.join(format!("{}.toml", name.trim())))
}

/// Load all profiles from the config directory
pub fn load_all_profiles() -> Result<Vec<Profile>> {
    load_all_profiles_in(&profiles_dir()?)
}

/// Load all profiles stored in `dir`, sorted by name
pub fn load_all_profiles_in(dir: &Path) -> Result<Vec<Profile>> {
    if !dir.exists() {
        debug!("Profiles directory does not exist: {}", dir.display());
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).context("Failed to read profiles directory")?;

    let mut profiles = Vec::new();

    for entry in entries {
        let path = entry?.path();

        // Skip non-TOML files
        if path.extension().and_then(|s| s.to_str()) != Some("toml") {
            continue;
        }

        match load_profile(&path) {
            Ok(profile) => profiles.push(profile),
            Err(e) => warn!("Failed to load profile {}: {:#}", path.display(), e),
        }
    }

    profiles.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    Ok(profiles)
}

/// Load a single profile by its name
pub fn load_profile_by_name(name: &str) -> Result<Profile> {
    load_profile_by_name_in(&profiles_dir()?, name)
}

pub fn load_profile_by_name_in(dir: &Path, name: &str) -> Result<Profile> {
    let path = profile_path_in(dir, name)?;
    if !path.exists() {
        return Err(Error::ProfileNotFound(name.to_string()).into());
    }
    load_profile(&path)
}

/// Load a single profile from a path
pub fn load_profile(path: &Path) -> Result<Profile> {
    let contents =
        fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;

    let profile: Profile =
        toml::from_str(&contents).context(format!("Failed to parse {}", path.display()))?;

    Ok(profile)
}

/// Save a profile to disk.
///
/// Profiles may carry passwords, so the file is written with mode 0600.
/// Returns the path the profile was saved to.
pub fn save_profile(profile: &Profile, overwrite: bool) -> Result<PathBuf> {
    save_profile_in(&profiles_dir()?, profile, overwrite)
}

pub fn save_profile_in(dir: &Path, profile: &Profile, overwrite: bool) -> Result<PathBuf> {
    profile.validate()?;

    fs::create_dir_all(dir).context("Failed to create profile directory")?;

    let profile_path = profile_path_in(dir, &profile.metadata.name)?;

    if !overwrite && profile_path.exists() {
        return Err(Error::ProfileExists(profile.metadata.name.clone()).into());
    }

    let mut profile = profile.clone();
    profile.metadata.modified_at = Utc::now();

    let toml_content = toml::to_string_pretty(&profile).context("Failed to serialize profile")?;

    fs::write(&profile_path, toml_content).context(format!(
        "Failed to write profile to {}",
        profile_path.display()
    ))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&profile_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set profile permissions")?;
    }

    debug!(
        "Saved profile '{}' to {}",
        profile.metadata.name,
        profile_path.display()
    );

    Ok(profile_path)
}

/// Delete a profile from disk by name
pub fn delete_profile_by_name(name: &str) -> Result<PathBuf> {
    delete_profile_by_name_in(&profiles_dir()?, name)
}

pub fn delete_profile_by_name_in(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = profile_path_in(dir, name)?;
    if !path.exists() {
        return Err(Error::ProfileNotFound(name.to_string()).into());
    }

    fs::remove_file(&path)
        .context(format!("Failed to delete profile from {}", path.display()))?;

    debug!("Deleted profile at {}", path.display());

    Ok(path)
}
