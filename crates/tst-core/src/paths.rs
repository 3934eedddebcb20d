//! Path/naming provider interface.
//!
//! Devices that write files ask a [`PathProvider`] where to put them. The
//! provider answers with a directory, a filename and a creation depth that
//! bounds how many missing parent directories the writer may create.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a device should write its next file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    /// Target directory.
    pub directory: PathBuf,
    /// File name without extension.
    pub filename: String,
    /// Directory creation depth.
    ///
    /// `0` creates nothing. A positive `d` means the first `d` path
    /// components must already exist and the rest may be created. A
    /// negative `d` allows creating at most the last `|d|` components.
    pub create_dir_depth: i32,
}

impl PathInfo {
    /// Full path of the file with the given extension.
    pub fn file_path(&self, extension: &str) -> PathBuf {
        self.directory.join(format!("{}.{}", self.filename, extension))
    }
}

/// Run metadata a provider uses to build paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Proposal the data belongs to.
    pub proposal_id: String,
    /// Facility cycle, e.g. `2025-2`.
    pub cycle: String,
    /// Data session, e.g. `pass-56789`.
    pub data_session: String,
    /// Beamline identifier.
    pub beamline_id: String,
    /// Scan number, if one has been allocated.
    pub scan_id: Option<u64>,
}

/// Gives file-writing devices a path per acquisition.
pub trait PathProvider: Send + Sync {
    /// Path for the next file of `device_name`.
    fn path_info(&self, device_name: &str) -> Result<PathInfo>;

    /// Metadata the provider was configured with.
    fn metadata(&self) -> &RunMetadata;
}
