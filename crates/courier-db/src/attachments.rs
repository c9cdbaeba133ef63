//! Filesystem object store for message attachments and profile avatars.
//!
//! Stored names are opaque UUIDs with the original extension preserved, so a
//! hostile filename can never escape the media root. Callers run `save` and
//! `delete` inside `spawn_blocking` alongside the DB mutation they belong to.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

pub const CHAT_ATTACHMENTS: &str = "chat/attachments";
pub const AVATARS: &str = "avatars";

pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [CHAT_ATTACHMENTS, AVATARS] {
            std::fs::create_dir_all(root.join(dir))
                .with_context(|| format!("creating media dir {}", dir))?;
        }
        info!("Attachment store rooted at {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Persist `bytes` under `dir`, returning the stored object name.
    pub fn save(&self, dir: &str, original_name: &str, bytes: &[u8]) -> Result<String> {
        let stored = match extension_of(original_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let path = self.root.join(dir).join(&stored);
        std::fs::write(&path, bytes)
            .with_context(|| format!("writing attachment {}", path.display()))?;
        Ok(stored)
    }

    /// Remove a stored object. Missing files are treated as already released.
    pub fn delete(&self, dir: &str, stored_name: &str) -> Result<()> {
        let path = self.root.join(dir).join(stored_name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing attachment {}", path.display())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// URL path under which the object is served, relative to the origin.
    pub fn public_path(dir: &str, stored_name: &str) -> String {
        format!("/media/{}/{}", dir, stored_name)
    }
}

fn extension_of(name: &str) -> Option<&str> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 16 && e.chars().all(|c| c.is_ascii_alphanumeric()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> AttachmentStore {
        let root = std::env::temp_dir().join(format!("courier-test-{}", Uuid::new_v4()));
        AttachmentStore::open(&root).unwrap()
    }

    #[test]
    fn save_keeps_extension_and_delete_is_idempotent() {
        let store = temp_store();
        let stored = store.save(CHAT_ATTACHMENTS, "photo.PNG", b"bytes").unwrap();
        assert!(stored.ends_with(".PNG"));
        assert!(store.root().join(CHAT_ATTACHMENTS).join(&stored).exists());

        store.delete(CHAT_ATTACHMENTS, &stored).unwrap();
        // Releasing an already-released object is not an error.
        store.delete(CHAT_ATTACHMENTS, &stored).unwrap();

        std::fs::remove_dir_all(store.root()).unwrap();
    }

    #[test]
    fn hostile_names_do_not_leak_into_stored_names() {
        let store = temp_store();
        let stored = store
            .save(CHAT_ATTACHMENTS, "../../etc/passwd", b"x")
            .unwrap();
        assert!(!stored.contains('/'));
        assert!(!stored.contains(".."));
        std::fs::remove_dir_all(store.root()).unwrap();
    }
}
