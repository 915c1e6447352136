use std::path::{Path, PathBuf};

use relay_types::{RelayError, Result};
use tokio::io::AsyncWriteExt;

/// Write `bytes` to `dir/name` so readers only ever see the complete file.
///
/// The content goes to a dot-prefixed temporary file first, is fsynced, and is
/// then renamed into place.
pub async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        RelayError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to create {}: {e}", dir.display()),
        ))
    })?;

    let tmp_path = dir.join(format!(".{name}.tmp"));
    let final_path = dir.join(name);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(RelayError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to rename into {}: {e}", final_path.display()),
        )));
    }

    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_final_file_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/box");

        let path = write_atomic(&dir, "out.json", b"{\"a\":1}").await.unwrap();
        assert_eq!(path, dir.join("out.json"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}");

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["out.json".to_string()]);
    }

    #[tokio::test]
    async fn overwrites_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        write_atomic(tmp.path(), "snap.json", b"[1]").await.unwrap();
        write_atomic(tmp.path(), "snap.json", b"[2]").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("snap.json")).unwrap(),
            "[2]"
        );
    }
}
