use std::path::{Component, Path};

use relay_types::{RelayError, Result};

/// Folder names that collide with shared directories.
const RESERVED_FOLDERS: &[&str] = &["errors", "global"];

const MAX_FOLDER_LEN: usize = 64;

/// Validate a working-folder name: `[A-Za-z0-9_-]{1,64}`, not reserved.
pub fn validate_folder_name(folder: &str) -> Result<()> {
    if folder.is_empty() || folder.len() > MAX_FOLDER_LEN {
        return Err(RelayError::Security(format!(
            "Folder name must be 1-{MAX_FOLDER_LEN} characters: '{folder}'"
        )));
    }
    if !folder
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(RelayError::Security(format!(
            "Folder name may only contain letters, digits, '_' and '-': '{folder}'"
        )));
    }
    if RESERVED_FOLDERS.contains(&folder.to_ascii_lowercase().as_str()) {
        return Err(RelayError::Security(format!(
            "Folder name is reserved: '{folder}'"
        )));
    }
    Ok(())
}

/// Check for path traversal attempts.
pub fn check_path_traversal(path: &str) -> bool {
    // Returns true if path traversal is detected
    path.contains('\0')
        || Path::new(path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

/// Validate a mount name relative to `/workspace/extra/`.
///
/// Must be a plain relative path without traversal.
pub fn validate_extra_mount_name(name: &str) -> bool {
    !name.is_empty()
        && !check_path_traversal(name)
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_folder_names() {
        assert!(validate_folder_name("main").is_ok());
        assert!(validate_folder_name("acme-team_2").is_ok());
        assert!(validate_folder_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn invalid_folder_names() {
        assert!(validate_folder_name("").is_err());
        assert!(validate_folder_name(&"a".repeat(65)).is_err());
        assert!(validate_folder_name("../etc").is_err());
        assert!(validate_folder_name("with space").is_err());
        assert!(validate_folder_name("a/b").is_err());
        assert!(validate_folder_name("errors").is_err());
        assert!(validate_folder_name("Global").is_err());
    }

    #[test]
    fn check_path_traversal_detection() {
        assert!(check_path_traversal("../secret"));
        assert!(check_path_traversal("dir/../../etc"));
        assert!(check_path_traversal("file\0.txt"));
        assert!(!check_path_traversal("normal/path/file.txt"));
        assert!(!check_path_traversal("notes..txt"));
    }

    #[test]
    fn extra_mount_names() {
        assert!(validate_extra_mount_name("docs"));
        assert!(validate_extra_mount_name("team/docs"));
        assert!(!validate_extra_mount_name(""));
        assert!(!validate_extra_mount_name("/etc"));
        assert!(!validate_extra_mount_name("../escape"));
        assert!(!validate_extra_mount_name("./docs"));
    }
}
