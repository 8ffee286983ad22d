// Permissions for trust store files and directories

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

/// Set file permissions to 0600 (owner read/write only)
pub fn set_file_permissions_private(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .context(format!("Failed to set permissions on {}", path.display()))?;
        debug!("Set file permissions to 0600: {}", path.display());
    }
    Ok(())
}

/// Ensure a directory exists, creating parents as needed.
/// Newly created directories get `mode`; existing ones are left alone.
pub fn ensure_directory(path: &Path, mode: u32) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    fs::create_dir_all(path).context(format!("Failed to create directory {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .context(format!("Failed to set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    debug!("Created directory: {}", path.display());
    Ok(())
}

/// Make sure `path` exists as a writable private file.
///
/// The parent directory is created with `dir_mode` if missing, and a new file is
/// created with mode 0600. An existing file is only checked for write access.
pub fn ensure_private_file(path: &Path, dir_mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_directory(parent, dir_mode)?;
        }
    }

    let mut options = fs::OpenOptions::new();
    options.append(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    match options.open(path) {
        Ok(_) => {
            // umask may have masked bits off the requested mode
            set_file_permissions_private(path)?;
            debug!("Created private file: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            fs::OpenOptions::new()
                .append(true)
                .open(path)
                .context(format!("{} is not writable", path.display()))?;
            Ok(())
        }
        Err(e) => Err(e).context(format!("Failed to create {}", path.display())),
    }
}
