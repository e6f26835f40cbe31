//! Shared primitives used by both the WAL proposer and the safekeeper side.

pub mod logging;
pub mod lsn;
