//! Proposal-aware path providers.
//!
//! Files land in
//! `<root>/<cycle>/<data_session>/assets/<device>/<YYYY>/<MM>/<DD>/<uuid>.<ext>`.
//! The beamline provider points `<root>` at the facility proposal tree and
//! only lets writers create the date and device levels; the mock provider
//! uses a directory under the user's home and is far less restrictive.

use crate::config::{ConfigError, PathsConfig};
use anyhow::Result;
use chrono::{Datelike, Local};
use std::path::{Path, PathBuf};
use tst_core::paths::{PathInfo, PathProvider, RunMetadata};
use uuid::Uuid;

/// Directory creation depth for the facility proposal tree.
pub const BEAMLINE_CREATE_DIR_DEPTH: i32 = -7;
/// Directory creation depth for the local mock tree.
pub const MOCK_CREATE_DIR_DEPTH: i32 = 3;

const DEFAULT_TLA: &str = "tst";

/// Three-letter beamline acronym, lowercase.
///
/// `ENDSTATION_ACRONYM` wins over `BEAMLINE_ACRONYM`; `tst` otherwise.
pub fn beamline_acronym() -> String {
    std::env::var("ENDSTATION_ACRONYM")
        .or_else(|_| std::env::var("BEAMLINE_ACRONYM"))
        .unwrap_or_else(|_| DEFAULT_TLA.to_string())
        .to_lowercase()
}

/// Path provider keyed on proposal, cycle and data session.
#[derive(Debug, Clone)]
pub struct ProposalPathProvider {
    root: PathBuf,
    metadata: RunMetadata,
    create_dir_depth: i32,
}

impl ProposalPathProvider {
    /// Provider for the facility proposal tree of beamline `tla`.
    pub fn beamline(tla: &str) -> Self {
        let tla = tla.to_lowercase();
        Self {
            root: PathBuf::from(format!("/nsls2/data1/{}/legacy/mock-proposals", tla)),
            metadata: RunMetadata {
                proposal_id: "commissioning".to_string(),
                cycle: "2025-2".to_string(),
                data_session: "pass-56789".to_string(),
                beamline_id: tla,
                scan_id: Some(1),
            },
            create_dir_depth: BEAMLINE_CREATE_DIR_DEPTH,
        }
    }

    /// Provider writing under `~/tst_mock_data/<tla>/proposals`.
    pub fn mock(tla: &str) -> Self {
        let tla = tla.to_lowercase();
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            root: home.join("tst_mock_data").join(&tla).join("proposals"),
            metadata: RunMetadata {
                proposal_id: "999999".to_string(),
                cycle: "2025-2".to_string(),
                data_session: "pass-999999".to_string(),
                beamline_id: tla,
                scan_id: Some(1),
            },
            create_dir_depth: MOCK_CREATE_DIR_DEPTH,
        }
    }

    /// Provider chosen by mock mode, with optional overrides from config.
    pub fn from_config(mock_mode: bool, tla: &str, paths: &PathsConfig) -> Self {
        let mut provider = if mock_mode {
            Self::mock(tla)
        } else {
            Self::beamline(tla)
        };
        if let Some(root) = &paths.root {
            provider.root = root.clone();
        }
        if let Some(proposal) = &paths.proposal_id {
            provider.metadata.proposal_id = proposal.clone();
        }
        if let Some(cycle) = &paths.cycle {
            provider.metadata.cycle = cycle.clone();
        }
        if let Some(session) = &paths.data_session {
            provider.metadata.data_session = session.clone();
        }
        if let Some(depth) = paths.create_dir_depth {
            provider.create_dir_depth = depth;
        }
        provider
    }

    /// Replace the root directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Proposals root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creation depth handed to writers.
    pub fn create_dir_depth(&self) -> i32 {
        self.create_dir_depth
    }

    fn directory_for(&self, device_name: &str) -> PathBuf {
        let today = Local::now().date_naive();
        self.root
            .join(&self.metadata.cycle)
            .join(&self.metadata.data_session)
            .join("assets")
            .join(device_name)
            .join(format!("{:04}", today.year()))
            .join(format!("{:02}", today.month()))
            .join(format!("{:02}", today.day()))
    }
}

impl PathProvider for ProposalPathProvider {
    fn path_info(&self, device_name: &str) -> Result<PathInfo> {
        if device_name.is_empty() {
            anyhow::bail!("path requested for a device without a name");
        }
        Ok(PathInfo {
            directory: self.directory_for(device_name),
            filename: Uuid::new_v4().to_string(),
            create_dir_depth: self.create_dir_depth,
        })
    }

    fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }
}

/// Make sure `info.directory` exists, creating only what its depth allows.
///
/// With depth `0` nothing is created and a missing directory is an error.
/// A positive depth `d` requires the first `d` components to exist already;
/// a negative depth allows creating at most the last `|d|` components.
pub fn ensure_directory(info: &PathInfo) -> Result<(), ConfigError> {
    let directory = &info.directory;
    let chain: Vec<&Path> = {
        let mut ancestors: Vec<&Path> = directory
            .ancestors()
            .filter(|p| p.parent().is_some())
            .collect();
        ancestors.reverse();
        ancestors
    };

    let depth = info.create_dir_depth;
    let must_exist = match depth {
        0 => chain.len(),
        d if d > 0 => (d as usize).min(chain.len()),
        d => chain.len().saturating_sub(d.unsigned_abs() as usize),
    };

    if let Some(missing) = chain[..must_exist].iter().find(|p| !p.is_dir()) {
        return Err(ConfigError::DirectoryNotCreatable {
            path: missing.to_path_buf(),
            depth,
        });
    }

    std::fs::create_dir_all(directory).map_err(|source| ConfigError::Io {
        path: directory.clone(),
        source,
    })
}
