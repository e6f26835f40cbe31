//! WAL broadcast proxy: tees the replication stream of a primary server to a
//! quorum of safekeepers and reports the quorum-acknowledged position back as
//! flush feedback.
//!
//! The proxy is a single-threaded event loop. It keeps a nonblocking TCP
//! connection per safekeeper, drives each through a handshake / epoch vote /
//! streaming state machine, fans every WAL record out to all of them and
//! prunes records once every safekeeper has confirmed them.

pub mod msg_queue;
pub mod net;
pub mod peer;
pub mod protocol;
pub mod proxy;
pub mod upstream;
