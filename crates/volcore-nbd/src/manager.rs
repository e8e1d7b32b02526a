//! Per-export config-fragment management.
//!
//! Each export is a small file in `<conf_dir>/<export_name>.conf`
//! referencing `device_path`. Writing is atomic: write to a temp file in
//! the same directory, then rename over the final path, so a concurrent
//! reload never observes a partially-written fragment.

use std::path::PathBuf;

use crate::error::{NbdError, NbdResult};

pub struct FragmentWriter {
    conf_dir: PathBuf,
}

impl FragmentWriter {
    #[must_use]
    pub fn new(conf_dir: impl Into<PathBuf>) -> Self {
        Self { conf_dir: conf_dir.into() }
    }

    #[must_use]
    pub fn config_path(&self, export_name: &str) -> PathBuf {
        self.conf_dir.join(format!("{export_name}.conf"))
    }

    fn render(export_name: &str, device_path: &str, port: u16) -> String {
        format!(
            "[{export_name}]\n\
             exportname = {device_path}\n\
             readonly = false\n\
             port = {port}\n"
        )
    }

    /// Write the fragment for `export_name`, atomically.
    pub async fn write(&self, export_name: &str, device_path: &str, port: u16) -> NbdResult<PathBuf> {
        tokio::fs::create_dir_all(&self.conf_dir).await.map_err(NbdError::Fragment)?;
        let final_path = self.config_path(export_name);
        let tmp_path = self.conf_dir.join(format!(".{export_name}.conf.tmp"));
        let contents = Self::render(export_name, device_path, port);
        tokio::fs::write(&tmp_path, contents).await.map_err(NbdError::Fragment)?;
        tokio::fs::rename(&tmp_path, &final_path).await.map_err(NbdError::Fragment)?;
        Ok(final_path)
    }

    /// Remove the fragment for `export_name`. Missing files are not an
    /// error — removal must be idempotent.
    pub async fn remove(&self, export_name: &str) -> NbdResult<()> {
        let path = self.config_path(export_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NbdError::Fragment(e)),
        }
    }
}
