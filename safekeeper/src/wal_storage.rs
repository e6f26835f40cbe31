//! Locating and opening stored WAL segments.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use std::fs::File;
use std::io::ErrorKind;

use pq_proto::TimeLineID;

pub type XLogSegNo = u64;

/// PostgreSQL-style WAL segment file name for `(timeline, segno)`.
pub fn wal_file_name(timeline: TimeLineID, segno: XLogSegNo, wal_seg_size: usize) -> String {
    let segs_per_xlogid = 0x1_0000_0000 / wal_seg_size as u64;
    format!(
        "{:>08X}{:>08X}{:>08X}",
        timeline,
        segno / segs_per_xlogid,
        segno % segs_per_xlogid
    )
}

/// Where a walsender finds stored WAL. The storage layout behind it is the
/// receiving side's business; a sender only ever needs an open segment.
pub trait SegmentStore: Send + Sync {
    fn open_segment(&self, timeline: TimeLineID, segno: XLogSegNo) -> Result<File>;
}

/// Directory of WAL segment files as the receiving side lays them out: a
/// segment still being written carries a `.partial` suffix and is renamed in
/// place once complete.
pub struct WalDir {
    pub dir: Utf8PathBuf,
    pub wal_seg_size: usize,
}

impl SegmentStore for WalDir {
    fn open_segment(&self, timeline: TimeLineID, segno: XLogSegNo) -> Result<File> {
        let name = wal_file_name(timeline, segno, self.wal_seg_size);
        // try the partial file first, it may be renamed under us
        let partial = self.dir.join(format!("{name}.partial"));
        match File::open(&partial) {
            Ok(file) => return Ok(file),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("could not open {partial}")),
        }
        let full = self.dir.join(&name);
        File::open(&full).with_context(|| format!("could not open WAL segment {full}"))
    }
}
