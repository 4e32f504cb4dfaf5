//! Upgrade state machine: search -> download -> check, one sub-machine per stage.
//!
//! The host drives transitions and publishes the composite [`ManagerState`]
//! after each one. Every transition method returns true when it changed the
//! state, so hosts only publish real transitions.

use std::cmp::Ordering;
use std::collections::HashSet;

use semver::Version;
use serde::Serialize;

use crate::installer::{precedence, InstallerDescriptor};
use crate::tracker::AvailableInstaller;

/// Bytes received so far out of the expected total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DownloadProgress {
    pub sofar: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "context", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchState {
    #[default]
    Idle,
    Searching { upgrades: Vec<AvailableInstaller> },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "context", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadState {
    #[default]
    Idle,
    Downloading { hash: String, sofar: u64, total: u64 },
    Failed { hash: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "context", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckState {
    #[default]
    Idle,
    Checking { hash: String },
    Available {
        filename: String,
        installer: InstallerDescriptor,
    },
    Failed { hash: String, error: String },
}

/// Composite snapshot observed by the application layer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ManagerState {
    pub search: SearchState,
    pub download: DownloadState,
    pub check: CheckState,
}

impl SearchState {
    pub fn is_searching(&self) -> bool {
        matches!(self, Self::Searching { .. })
    }

    pub fn upgrades(&self) -> &[AvailableInstaller] {
        match self {
            Self::Searching { upgrades } => upgrades,
            Self::Idle => &[],
        }
    }
}

impl DownloadState {
    pub fn is_downloading(&self) -> bool {
        matches!(self, Self::Downloading { .. })
    }

    pub fn progress(&self) -> Option<DownloadProgress> {
        match self {
            Self::Downloading { sofar, total, .. } => Some(DownloadProgress {
                sofar: *sofar,
                total: *total,
            }),
            _ => None,
        }
    }
}

impl CheckState {
    pub fn is_checking(&self) -> bool {
        matches!(self, Self::Checking { .. })
    }
}

impl ManagerState {
    /// True while a transfer or its verification is under way.
    pub fn is_busy(&self) -> bool {
        self.download.is_downloading() || self.check.is_checking()
    }

    pub fn start_search(&mut self) -> bool {
        if self.search.is_searching() {
            return false;
        }
        self.search = SearchState::Searching {
            upgrades: Vec::new(),
        };
        true
    }

    pub fn stop_search(&mut self) -> bool {
        if !self.search.is_searching() {
            return false;
        }
        self.search = SearchState::Idle;
        true
    }

    /// Replace the candidate list. Ignored unless searching.
    pub fn set_upgrades(&mut self, upgrades: Vec<AvailableInstaller>) -> bool {
        match &mut self.search {
            SearchState::Searching { upgrades: current } if *current != upgrades => {
                *current = upgrades;
                true
            }
            _ => false,
        }
    }

    /// Enter `Downloading` for `hash`. Refused while another transfer or check runs.
    pub fn begin_download(&mut self, hash: &str, total: u64) -> bool {
        if self.is_busy() {
            return false;
        }
        self.download = DownloadState::Downloading {
            hash: hash.to_string(),
            sofar: 0,
            total,
        };
        true
    }

    /// Record bytes received. Progress never moves backwards within one attempt.
    pub fn record_progress(&mut self, sofar: u64) -> bool {
        match &mut self.download {
            DownloadState::Downloading { sofar: current, .. } if sofar > *current => {
                *current = sofar;
                true
            }
            _ => false,
        }
    }

    /// Stream completed: download returns to idle and the check stage takes over.
    pub fn finish_download(&mut self) -> bool {
        let DownloadState::Downloading { hash, .. } = &self.download else {
            return false;
        };
        self.check = CheckState::Checking { hash: hash.clone() };
        self.download = DownloadState::Idle;
        true
    }

    pub fn fail_download(&mut self, error: impl Into<String>) -> bool {
        let DownloadState::Downloading { hash, .. } = &self.download else {
            return false;
        };
        self.download = DownloadState::Failed {
            hash: hash.clone(),
            error: error.into(),
        };
        true
    }

    /// The store verified and promoted the installer; its filename is the hash.
    pub fn check_passed(&mut self, installer: InstallerDescriptor) -> bool {
        if !self.check.is_checking() {
            return false;
        }
        self.check = CheckState::Available {
            filename: installer.hash.clone(),
            installer,
        };
        true
    }

    pub fn check_failed(&mut self, error: impl Into<String>) -> bool {
        let CheckState::Checking { hash } = &self.check else {
            return false;
        };
        self.check = CheckState::Failed {
            hash: hash.clone(),
            error: error.into(),
        };
        true
    }
}

/// Remote installers worth downloading: not held locally, built for this
/// device, and strictly newer than what it runs.
pub fn upgrade_candidates(
    available: &[AvailableInstaller],
    owned: &HashSet<String>,
    platform: &str,
    arch: &[String],
    current: &Version,
) -> Vec<AvailableInstaller> {
    available
        .iter()
        .filter(|a| !owned.contains(a.hash()))
        .filter(|a| a.installer.is_compatible(platform, arch))
        .filter(|a| precedence(&a.installer.version, current) == Ordering::Greater)
        .cloned()
        .collect()
}

/// Newest candidate; ties go to the lowest hash so every device picks alike.
pub fn choose_candidate(candidates: &[AvailableInstaller]) -> Option<&AvailableInstaller> {
    candidates.iter().max_by(|a, b| {
        precedence(&a.installer.version, &b.installer.version)
            .then_with(|| b.installer.hash.cmp(&a.installer.hash))
    })
}
