//! Locally-stored attachment files under `{data_dir}/attachments/{kind}/`.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::model::EntityKind;

#[derive(Debug, Clone)]
pub struct AttachmentFiles {
    root: PathBuf,
}

impl AttachmentFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn kind_dir(&self, kind: EntityKind) -> io::Result<PathBuf> {
        let dir = self.root.join(kind.as_str());
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Copy a picked file into app storage, named after its attachment ref.
    /// Returns the stored path and the original file name.
    pub async fn import(
        &self,
        kind: EntityKind,
        local_ref: &str,
        source: &Path,
    ) -> io::Result<(PathBuf, String)> {
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;
        let dest = self
            .kind_dir(kind)
            .await?
            .join(stored_name(local_ref, Path::new(&file_name)));
        fs::copy(source, &dest).await?;
        debug!(src=%source.display(), dest=%dest.display(), "imported attachment");
        Ok((dest, file_name))
    }

    /// Store downloaded bytes for a server image.
    pub async fn write_download(
        &self,
        kind: EntityKind,
        image_id: &str,
        file_name: Option<&str>,
        bytes: &[u8],
    ) -> io::Result<PathBuf> {
        let hint = Path::new(file_name.unwrap_or("image.jpg"));
        let dest = self.kind_dir(kind).await?.join(stored_name(image_id, hint));
        fs::write(&dest, bytes).await?;
        Ok(dest)
    }

    /// Remove files we own. Failures are logged and never propagated.
    pub async fn remove_best_effort(&self, paths: &[PathBuf]) {
        for path in paths {
            if !path.starts_with(&self.root) {
                debug!(path=%path.display(), "not an app-owned file; leaving in place");
                continue;
            }
            match fs::remove_file(path).await {
                Ok(()) => debug!(path=%path.display(), "removed attachment file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(?err, path=%path.display(), "failed to remove attachment file"),
            }
        }
    }
}

/// File name for an id. Ids that need escaping get a digest suffix so they
/// cannot land on the same file as an id that did not.
fn stored_name(stem: &str, original: &Path) -> String {
    let mut safe: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if safe != stem {
        let digest = format!("{:x}", Sha256::digest(stem.as_bytes()));
        safe.push('_');
        safe.push_str(&digest[..8]);
    }
    match original.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{safe}.{}", ext.to_ascii_lowercase()),
        None => safe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn import_copies_into_kind_dir() {
        let td = tempdir().unwrap();
        let src = td.path().join("photo.JPG");
        std::fs::write(&src, b"img").unwrap();
        let files = AttachmentFiles::new(td.path().join("attachments"));

        let (stored, name) = files
            .import(EntityKind::Sign, "local_image_1_a", &src)
            .await
            .unwrap();
        assert_eq!(name, "photo.JPG");
        assert_eq!(
            stored,
            td.path().join("attachments/sign/local_image_1_a.jpg")
        );
        assert_eq!(std::fs::read(&stored).unwrap(), b"img");
        assert!(src.exists());
    }

    #[tokio::test]
    async fn remove_only_touches_owned_files() {
        let td = tempdir().unwrap();
        let files = AttachmentFiles::new(td.path().join("attachments"));
        let owned = files
            .write_download(EntityKind::Collision, "img/9", Some("x.png"), b"p")
            .await
            .unwrap();
        let name = owned.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("img_9_") && name.ends_with(".png"));
        let foreign = td.path().join("keep.jpg");
        std::fs::write(&foreign, b"k").unwrap();

        files
            .remove_best_effort(&[owned.clone(), foreign.clone(), td.path().join("attachments/missing")])
            .await;
        assert!(!owned.exists());
        assert!(foreign.exists());
    }

    #[tokio::test]
    async fn escaped_ids_do_not_share_a_file() {
        let td = tempdir().unwrap();
        let files = AttachmentFiles::new(td.path().join("attachments"));
        let slashed = files
            .write_download(EntityKind::Sign, "img/9", Some("a.jpg"), b"slash")
            .await
            .unwrap();
        let plain = files
            .write_download(EntityKind::Sign, "img_9", Some("a.jpg"), b"plain")
            .await
            .unwrap();
        assert_ne!(slashed, plain);
        assert!(plain.ends_with("img_9.jpg"));
        assert_eq!(std::fs::read(&slashed).unwrap(), b"slash");
        assert_eq!(std::fs::read(&plain).unwrap(), b"plain");
    }
}
