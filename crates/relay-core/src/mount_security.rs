use std::path::{Path, PathBuf};

use relay_config::Config;
use relay_types::{AdditionalMount, RegisteredGroup, RelayError, Result};
use tracing::warn;

use crate::security::{check_path_traversal, validate_extra_mount_name};

/// Mount permission mode for container volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// A validated bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
}

impl MountSpec {
    fn new(host_path: PathBuf, container_path: impl Into<String>, mode: MountMode) -> Self {
        Self {
            host_path,
            container_path: container_path.into(),
            mode,
        }
    }

    /// Format as a `-v` argument value: `host:container`, suffixed `:ro` when read-only.
    pub fn to_volume_arg(&self) -> String {
        match self.mode {
            MountMode::ReadOnly => format!(
                "{}:{}:ro",
                self.host_path.display(),
                self.container_path
            ),
            MountMode::ReadWrite => {
                format!("{}:{}", self.host_path.display(), self.container_path)
            }
        }
    }
}

/// Build the mount list for one invocation of `group`.
///
/// `privileged` comes from the invocation, not the group: scheduled runs of the
/// main conversation are not privileged.
///
/// Standard mounts:
/// - `{groups_dir}/{folder}`        → `/workspace/group` (rw)
/// - global memory file             → `/workspace/global/<name>` (ro unless privileged, skipped if absent)
/// - `{data_dir}/sessions/{folder}` → `/workspace/session` (rw)
/// - `{data_dir}/ipc/{folder}`      → `/workspace/ipc` (rw)
///
/// Extra mounts land under `/workspace/extra/`; invalid ones are skipped with a warning.
pub fn build_mounts(config: &Config, group: &RegisteredGroup, privileged: bool) -> Vec<MountSpec> {
    let folder = &group.folder;
    let mut mounts = vec![MountSpec::new(
        config.groups_dir.join(folder),
        "/workspace/group",
        MountMode::ReadWrite,
    )];

    if config.global_memory_path.is_file() {
        if let Some(name) = config.global_memory_path.file_name() {
            let mode = if privileged {
                MountMode::ReadWrite
            } else {
                MountMode::ReadOnly
            };
            mounts.push(MountSpec::new(
                config.global_memory_path.clone(),
                format!("/workspace/global/{}", name.to_string_lossy()),
                mode,
            ));
        }
    }

    mounts.push(MountSpec::new(
        config.sessions_dir().join(folder),
        "/workspace/session",
        MountMode::ReadWrite,
    ));
    mounts.push(MountSpec::new(
        config.ipc_dir().join(folder),
        "/workspace/ipc",
        MountMode::ReadWrite,
    ));

    for extra in group.additional_mounts() {
        match resolve_extra_mount(extra, &config.mount_allowlist) {
            Ok(spec) => mounts.push(spec),
            Err(e) => warn!(
                group = %folder,
                host_path = %extra.host_path,
                error = %e,
                "Skipping extra mount"
            ),
        }
    }

    mounts
}

/// Validate one extra mount against the allow-list.
pub fn resolve_extra_mount(mount: &AdditionalMount, allowlist: &[PathBuf]) -> Result<MountSpec> {
    if check_path_traversal(&mount.host_path) {
        return Err(RelayError::Security(format!(
            "Path traversal detected in mount: {}",
            mount.host_path
        )));
    }

    let host = Path::new(&mount.host_path);
    let canonical = host.canonicalize().map_err(|e| {
        RelayError::Security(format!("Mount source {} is unavailable: {e}", mount.host_path))
    })?;

    let allowed = allowlist
        .iter()
        .filter_map(|root| root.canonicalize().ok())
        .any(|root| canonical.starts_with(root));
    if !allowed {
        return Err(RelayError::Security(format!(
            "Mount source not in allow-list: {}",
            mount.host_path
        )));
    }

    let name = match &mount.container_path {
        Some(name) => name.clone(),
        None => canonical
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    if !validate_extra_mount_name(&name) {
        return Err(RelayError::Security(format!(
            "Invalid container path for extra mount: '{name}'"
        )));
    }

    let mode = if mount.read_write {
        MountMode::ReadWrite
    } else {
        MountMode::ReadOnly
    };
    Ok(MountSpec::new(
        canonical,
        format!("/workspace/extra/{name}"),
        mode,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_types::ContainerConfig;

    fn make_group(folder: &str, is_main: bool, extra: Vec<AdditionalMount>) -> RegisteredGroup {
        RegisteredGroup {
            jid: format!("tg:{folder}"),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: "@Andy".to_string(),
            allowed_senders: None,
            container_config: Some(ContainerConfig {
                additional_mounts: extra,
                timeout: None,
            }),
            requires_trigger: true,
            is_main,
            added_at: Utc::now(),
        }
    }

    fn extra(host: &Path, name: Option<&str>, read_write: bool) -> AdditionalMount {
        AdditionalMount {
            host_path: host.to_string_lossy().to_string(),
            container_path: name.map(str::to_string),
            read_write,
        }
    }

    #[test]
    fn standard_mounts_without_global_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::with_base_dir(tmp.path());
        let mounts = build_mounts(&cfg, &make_group("acme", false, vec![]), false);

        let targets: Vec<&str> = mounts.iter().map(|m| m.container_path.as_str()).collect();
        assert_eq!(
            targets,
            vec!["/workspace/group", "/workspace/session", "/workspace/ipc"]
        );
        assert!(mounts.iter().all(|m| m.mode == MountMode::ReadWrite));
        assert_eq!(mounts[0].host_path, cfg.groups_dir.join("acme"));
        assert_eq!(mounts[2].host_path, cfg.ipc_dir().join("acme"));
    }

    #[test]
    fn global_memory_read_only_unless_main() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::with_base_dir(tmp.path());
        std::fs::create_dir_all(cfg.global_memory_path.parent().unwrap()).unwrap();
        std::fs::write(&cfg.global_memory_path, "# shared").unwrap();

        let mounts = build_mounts(&cfg, &make_group("acme", false, vec![]), false);
        let global = mounts
            .iter()
            .find(|m| m.container_path == "/workspace/global/MEMORY.md")
            .unwrap();
        assert_eq!(global.mode, MountMode::ReadOnly);
        assert!(global.to_volume_arg().ends_with(":/workspace/global/MEMORY.md:ro"));

        let main = make_group("main", true, vec![]);
        let mounts = build_mounts(&cfg, &main, true);
        let global = mounts
            .iter()
            .find(|m| m.container_path == "/workspace/global/MEMORY.md")
            .unwrap();
        assert_eq!(global.mode, MountMode::ReadWrite);

        // A non-privileged invocation of the main group still gets read-only memory
        let mounts = build_mounts(&cfg, &main, false);
        let global = mounts
            .iter()
            .find(|m| m.container_path == "/workspace/global/MEMORY.md")
            .unwrap();
        assert_eq!(global.mode, MountMode::ReadOnly);
    }

    #[test]
    fn extra_mount_inside_allowlist() {
        let tmp = tempfile::tempdir().unwrap();
        let docs = tmp.path().join("shared/docs");
        std::fs::create_dir_all(&docs).unwrap();
        let mut cfg = Config::with_base_dir(tmp.path());
        cfg.mount_allowlist = vec![tmp.path().join("shared")];

        let group = make_group(
            "acme",
            false,
            vec![extra(&docs, None, false), extra(&docs, Some("rw-docs"), true)],
        );
        let mounts = build_mounts(&cfg, &group, false);
        assert_eq!(mounts.len(), 5);
        assert_eq!(mounts[3].container_path, "/workspace/extra/docs");
        assert_eq!(mounts[3].mode, MountMode::ReadOnly);
        assert_eq!(mounts[4].container_path, "/workspace/extra/rw-docs");
        assert_eq!(mounts[4].mode, MountMode::ReadWrite);
        assert!(!mounts[4].to_volume_arg().ends_with(":ro"));
    }

    #[test]
    fn extra_mounts_rejected_and_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let inside = tmp.path().join("shared/docs");
        let outside = tmp.path().join("private");
        std::fs::create_dir_all(&inside).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        let allow = vec![tmp.path().join("shared")];

        // Outside allow-list
        assert!(resolve_extra_mount(&extra(&outside, None, false), &allow).is_err());
        // Missing source
        let missing = tmp.path().join("shared/missing");
        assert!(resolve_extra_mount(&extra(&missing, None, false), &allow).is_err());
        // Traversal
        let sneaky = tmp.path().join("shared/../private");
        assert!(resolve_extra_mount(&extra(&sneaky, None, false), &allow).is_err());
        // Bad container name
        assert!(resolve_extra_mount(&extra(&inside, Some("../etc"), false), &allow).is_err());
        // Empty allow-list blocks everything
        assert!(resolve_extra_mount(&extra(&inside, None, false), &[]).is_err());

        let mut cfg = Config::with_base_dir(tmp.path());
        cfg.mount_allowlist = allow;
        let group = make_group("acme", false, vec![extra(&outside, None, false)]);
        assert_eq!(build_mounts(&cfg, &group, false).len(), 3);
    }
}
