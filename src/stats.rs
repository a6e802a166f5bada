//! Block I/O statistics.

use std::fmt;
use std::ops::Sub;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytesize::ByteSize;

/// I/O counters shared by all stores of a sorter.
#[derive(Debug, Default)]
pub struct IoStats {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    wait_nanos: AtomicU64,
}

impl IoStats {
    pub fn new() -> Self {
        IoStats::default()
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_wait(&self, waited: Duration) {
        self.wait_nanos.fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Returns a copy of the current counters.
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            wait_time: Duration::from_nanos(self.wait_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`IoStats`]. Subtracting two snapshots yields the activity in between.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Time spent blocked on I/O completion.
    pub wait_time: Duration,
}

impl Sub for IoStatsSnapshot {
    type Output = IoStatsSnapshot;

    fn sub(self, rhs: Self) -> Self::Output {
        IoStatsSnapshot {
            reads: self.reads.saturating_sub(rhs.reads),
            writes: self.writes.saturating_sub(rhs.writes),
            bytes_read: self.bytes_read.saturating_sub(rhs.bytes_read),
            bytes_written: self.bytes_written.saturating_sub(rhs.bytes_written),
            wait_time: self.wait_time.saturating_sub(rhs.wait_time),
        }
    }
}

impl fmt::Display for IoStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "I/O statistics")?;
        writeln!(f, "  total number of reads   : {}", self.reads)?;
        writeln!(f, "  total number of writes  : {}", self.writes)?;
        writeln!(f, "  number of bytes read    : {}", ByteSize(self.bytes_read))?;
        writeln!(f, "  number of bytes written : {}", ByteSize(self.bytes_written))?;
        write!(f, "  I/O wait time           : {:.3} s", self.wait_time.as_secs_f64())
    }
}
