use std::path::{Path, PathBuf};

use super::config::Config;
use super::data_store::{classify_part_file, DataStore};
use super::error::StagerError;

/// Stager copies part files from a staging area (usually a mounted share) into the data path.
///
/// Parts already known to the data path, by kind and hal stamp, are left alone.
pub struct Stager {
    file_stack: Vec<(PathBuf, PathBuf, u64)>,
    total_data_size_bytes: u64,
    n_skipped: usize,
}

impl Stager {
    /// Create a new Stager. Requires the config to name a staging path.
    pub fn new(config: &Config) -> Result<Self, StagerError> {
        let source = config.get_staging_path()?;
        let existing = if config.data_path.is_dir() {
            DataStore::scan(&config.data_path).ok()
        } else {
            None
        };
        Self::from_paths(source, &config.data_path, existing.as_ref())
    }

    fn from_paths(
        source: &Path,
        destination: &Path,
        existing: Option<&DataStore>,
    ) -> Result<Self, StagerError> {
        if !source.is_dir() {
            return Err(StagerError::BadSourcePath(source.to_path_buf()));
        }
        let mut files: Vec<PathBuf> = Vec::new();
        Self::get_file_stack(source, &mut files)?;
        files.sort();

        let mut stack: Vec<(PathBuf, PathBuf, u64)> = Vec::new();
        let mut total_size: u64 = 0;
        let mut n_skipped = 0;
        for path in files {
            let Some((kind, stamp)) = classify_part_file(&path) else {
                continue;
            };
            let relative = path.strip_prefix(source).unwrap_or(&path);
            let dst = destination.join(relative);
            let known = existing
                .map(|store| store.path(kind, &stamp).is_some())
                .unwrap_or(false);
            if known || dst.exists() {
                n_skipped += 1;
                continue;
            }
            let bytes = path.metadata()?.len();
            stack.push((path, dst, bytes));
            total_size += bytes;
        }
        Ok(Self {
            file_stack: stack,
            total_data_size_bytes: total_size,
            n_skipped,
        })
    }

    fn get_file_stack(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), StagerError> {
        for item in dir.read_dir()? {
            let item_path = item?.path();
            if item_path.is_dir() {
                Self::get_file_stack(&item_path, files)?;
            } else {
                files.push(item_path);
            }
        }
        Ok(())
    }

    /// Get total copy size of files.
    pub fn get_total_data_size(&self) -> u64 {
        self.total_data_size_bytes
    }

    /// Number of part files left alone because the data path already has them
    pub fn get_n_skipped(&self) -> usize {
        self.n_skipped
    }

    /// Source, destination and size in bytes of every file to copy
    pub fn copy_meta(&self) -> &[(PathBuf, PathBuf, u64)] {
        &self.file_stack
    }
}
