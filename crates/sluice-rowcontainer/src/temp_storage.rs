use std::path::{Path, PathBuf};
use std::sync::Arc;

use error_stack::{IntoReport, ResultExt};
use tempfile::{NamedTempFile, TempDir};

use crate::Error;

/// A node-wide directory for spilled rows.
///
/// The directory and every file in it are removed when the storage is
/// dropped.
#[derive(Debug)]
pub struct TempStorage {
    dir: TempDir,
}

impl TempStorage {
    /// Creates the storage under `parent`, or under the system temp
    /// directory if `parent` is `None`.
    pub fn new(parent: Option<&Path>) -> error_stack::Result<Arc<Self>, Error> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("sluice-temp-");
            builder
        };
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .into_report()
        .change_context(Error::CreateTempStorage)?;
        tracing::info!("Using temporary storage at {}", dir.path().display());
        Ok(Arc::new(Self { dir }))
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_owned()
    }

    pub(crate) fn create_file(&self, prefix: &str) -> error_stack::Result<NamedTempFile, Error> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(self.dir.path())
            .into_report()
            .change_context(Error::Io("create"))
    }
}
