//! Fixed mount-root containment.
//!
//! Every restore mount directory must live directly under one
//! administrator-configured root, named after the restore mount's own id
//! rather than the backup disk's (a disk can be mounted, unmounted, and
//! remounted under a fresh path each time). `MountRoot` is the only way to
//! turn a mount id into a path, so a caller can't accidentally construct
//! one that escapes it.

use std::path::{Component, Path, PathBuf};

use crate::error::{RestoreError, RestoreResult};

#[derive(Debug, Clone)]
pub struct MountRoot {
    root: PathBuf,
}

impl MountRoot {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<mount_id>`. A generated entity id can never contain path
    /// separators or `..`, but the check still runs so a refactor that
    /// starts taking caller-supplied names can't silently regress it.
    pub fn mount_path(&self, mount_id: &str) -> RestoreResult<PathBuf> {
        let candidate = self.root.join(mount_id);
        self.ensure_contains(&candidate)?;
        Ok(candidate)
    }

    fn ensure_contains(&self, candidate: &Path) -> RestoreResult<()> {
        let mut depth: i32 = 0;
        for component in candidate.strip_prefix(&self.root).unwrap_or(candidate).components() {
            match component {
                Component::ParentDir => depth -= 1,
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(RestoreError::Containment(format!(
                        "{} is not relative to mount root {}",
                        candidate.display(),
                        self.root.display()
                    )))
                }
            }
            if depth < 0 {
                return Err(RestoreError::Containment(format!(
                    "{} escapes mount root {}",
                    candidate.display(),
                    self.root.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_path_stays_under_root() {
        let root = MountRoot::new("/var/lib/volcore/restore");
        let path = root.mount_path("9f2c2b1e-1111-4a2b-8c3d-000000000001").unwrap();
        assert_eq!(path, Path::new("/var/lib/volcore/restore/9f2c2b1e-1111-4a2b-8c3d-000000000001"));
    }

    #[test]
    fn rejects_traversal_outside_root() {
        let root = MountRoot::new("/var/lib/volcore/restore");
        let err = root.ensure_contains(Path::new("/var/lib/volcore/restore/../../etc/passwd")).unwrap_err();
        assert!(matches!(err, RestoreError::Containment(_)));
    }
}
