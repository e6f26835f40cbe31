#![deny(clippy::undocumented_unsafe_blocks)]
//! Safekeeper-side WAL serving: once received WAL is durably stored, the
//! flush notifier wakes per-client walsender threads which re-stream the
//! stored segments to downstream replication consumers.

use camino::Utf8PathBuf;
use pq_proto::{SystemId, TimeLineID};

pub mod send_wal;
pub mod wal_service;
pub mod wal_storage;

#[derive(Debug, Clone)]
pub struct SafekeeperConf {
    /// Directory holding the stored WAL segment files.
    pub wal_dir: Utf8PathBuf,
    pub system_id: SystemId,
    pub timeline: TimeLineID,
    pub wal_seg_size: usize,
}

impl SafekeeperConf {
    /// Segment store rooted at this configuration's WAL directory.
    pub fn wal_store(&self) -> wal_storage::WalDir {
        wal_storage::WalDir {
            dir: self.wal_dir.clone(),
            wal_seg_size: self.wal_seg_size,
        }
    }
}
