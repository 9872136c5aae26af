//! Process-wide settings, resolved once at startup and passed explicitly.

use crate::lock::WorkerClass;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Concurrency cap of each worker class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCaps {
    builder: u32,
}

impl WorkerCaps {
    /// The fetcher class is always capped at one so fetches are serialized.
    pub const FETCHER: u32 = 1;

    pub fn new(max_parallel_builds: u32) -> Self {
        Self {
            builder: max_parallel_builds.max(1),
        }
    }

    pub fn cap(&self, class: WorkerClass) -> u32 {
        match class {
            WorkerClass::Fetcher => Self::FETCHER,
            WorkerClass::Builder => self.builder,
        }
    }
}

impl Default for WorkerCaps {
    fn default() -> Self {
        Self::new(1)
    }
}

/// On-disk layout of working directories and published snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub data_dir: PathBuf,
    /// Holds patch files.
    pub configuration_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub snapshots_url: String,
}

impl Layout {
    /// Sub-directories of `data_dir` created at startup.
    pub const DATA_SUBDIRS: [&'static str; 7] =
        ["builds", "ccache", "src", "triggers", "bshomes", "pollers", "locks"];

    pub fn src_dir(&self, project: &str) -> PathBuf {
        self.data_dir.join("src").join(project)
    }

    pub fn build_dir(&self, platform: &str, project: &str) -> PathBuf {
        self.data_dir.join("builds").join(platform).join(project)
    }

    pub fn nightly_dir(&self, project: &str) -> PathBuf {
        self.data_dir
            .join("triggers")
            .join(format!("nightly-{project}"))
    }

    pub fn poller_dir(&self, project: &str) -> PathBuf {
        self.data_dir.join("pollers").join(project)
    }

    /// Lock files shared by every relay process using this data directory.
    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    pub fn snapshots_path(&self, project: &str) -> PathBuf {
        self.snapshots_dir.join(project)
    }

    /// Public URL of a project's snapshots, always ending with `/{project}/`.
    pub fn snapshots_url_for(&self, project: &str) -> String {
        format!("{}/{}/", self.snapshots_url.trim_end_matches('/'), project)
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            configuration_dir: PathBuf::from("/etc/relay"),
            snapshots_dir: PathBuf::from("/data/snapshots"),
            snapshots_url: "http://localhost/snapshots".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Compiler job count, passed to every compile action.
    pub max_jobs: u32,
    pub caps: WorkerCaps,
    /// Debounce window of change-triggered schedulers.
    pub tree_stable: Duration,
    pub poll_interval: Duration,
    pub layout: Layout,
}

impl RuntimeSettings {
    /// Logical CPU count plus one.
    pub fn default_max_jobs() -> u32 {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        u32::try_from(cpus).unwrap_or(u32::MAX - 1) + 1
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_jobs: Self::default_max_jobs(),
            caps: WorkerCaps::default(),
            tree_stable: Duration::from_secs(300),
            poll_interval: Duration::from_secs(60),
            layout: Layout::default(),
        }
    }
}
