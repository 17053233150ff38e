#![forbid(unsafe_code)]
//! Shared types for the lazywright write-behind engine.
//!
//! Newtype identifiers, the per-stream flag word, flush dispositions, and
//! the validated engine configuration.

use bitflags::bitflags;
use lw_error::{LwError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of a cached file stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

/// Identifier of the file object backing a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

bitflags! {
    /// Per-stream state bits, mutated only under the engine's master lock.
    ///
    /// `WRITE_QUEUED` doubles as a mutex against concurrent flushes of the
    /// same stream and as a do-not-reclaim pin while a worker owns it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StreamFlags: u32 {
        const WRITE_QUEUED            = 1 << 0;
        const MODIFIED_WRITE_DISABLED = 1 << 1;
        const WAITING_FOR_TEARDOWN    = 1 << 2;
        const IS_CURSOR               = 1 << 3;
        const TEMPORARY_FILE          = 1 << 4;
    }
}

impl Default for StreamFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Attributes supplied when a stream is first registered with the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAttrs {
    /// The stream must be flushed with exclusive access (metadata).
    pub modified_write_disabled: bool,
    /// The stream backs a temporary file.
    pub temporary: bool,
    /// Current file size in bytes.
    pub file_size: u64,
}

/// Outcome of a successful `write_behind` dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// The backend flushed this many pages; the engine debits dirty counts.
    Flushed { pages: u64 },
    /// The backend needs to run again; the entry is reinserted at the tail
    /// of the queue it came from and the stream stays queued.
    Requeue,
}

/// Flush 1/N of the dirty pages per tick once the total exceeds N.
pub const AGE_TARGET: u64 = 8;
/// Metadata streams are serviced on 1 out of every 16 visits.
pub const PASS_COUNT_MASK: u64 = 0xF;
/// Drop and re-take the master lock after this many skipped visits.
pub const LOCK_COURTESY_VISITS: u32 = 20;
/// Oversized metadata streams release their backlog in these fractions.
pub const METADATA_DIVISOR: u64 = 8;
/// A draining worker re-scans only when at least this many pages are dirty.
pub const RESCAN_THRESHOLD_PAGES: u64 = 20;
/// A stream is oversized at this multiple of the max write-behind size.
pub const OVERSIZE_FACTOR: u64 = 4;
/// Retry priority handed to the deferred-write admission check.
pub const MAX_RETRY_PRIORITY: u8 = u8::MAX;

/// Runtime configuration for the lazy-writer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyWriterConfig {
    /// Delay before the first scan after going from idle to active, to let
    /// an application finish a save burst.
    pub first_delay: Duration,
    /// Delay between scans while the writer stays active.
    pub idle_delay: Duration,
    /// Delay used for a fast (immediate) scan.
    pub no_delay: Duration,
    /// Global dirty-page count the budget computation aims to land on.
    pub dirty_page_target: u64,
    /// Largest single write-behind I/O, in pages.
    pub max_write_behind_pages: u64,
    /// Page threshold handed to the deferred-write admission check for
    /// temporary files.
    pub write_charge_threshold_pages: u64,
    /// Small-memory system: metadata streams are not pass-gated.
    pub small_system: bool,
    /// Fixed capacity of the worker pool.
    pub worker_count: usize,
    /// Upper bound on outstanding work-queue entries. Exhaustion is the
    /// engine's out-of-memory signal and exercises the self-healing paths.
    pub work_entry_limit: usize,
}

impl Default for LazyWriterConfig {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(3),
            idle_delay: Duration::from_secs(1),
            no_delay: Duration::ZERO,
            dirty_page_target: 4096,
            max_write_behind_pages: 16,
            write_charge_threshold_pages: 64,
            small_system: false,
            worker_count: 4,
            work_entry_limit: 256,
        }
    }
}

impl LazyWriterConfig {
    /// Validate the configuration, returning it unchanged on success.
    pub fn validate(self) -> Result<Self> {
        if self.first_delay.is_zero() {
            return Err(LwError::Config("first_delay must be > 0".to_owned()));
        }
        if self.idle_delay.is_zero() {
            return Err(LwError::Config("idle_delay must be > 0".to_owned()));
        }
        if self.dirty_page_target == 0 {
            return Err(LwError::Config("dirty_page_target must be > 0".to_owned()));
        }
        if self.max_write_behind_pages == 0 {
            return Err(LwError::Config(
                "max_write_behind_pages must be > 0".to_owned(),
            ));
        }
        if self.worker_count == 0 {
            return Err(LwError::Config("worker_count must be > 0".to_owned()));
        }
        if self.work_entry_limit == 0 {
            return Err(LwError::Config("work_entry_limit must be > 0".to_owned()));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(LazyWriterConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_delays_are_rejected() {
        let config = LazyWriterConfig {
            idle_delay: Duration::ZERO,
            ..LazyWriterConfig::default()
        };
        assert!(matches!(config.validate(), Err(LwError::Config(_))));

        let config = LazyWriterConfig {
            first_delay: Duration::ZERO,
            ..LazyWriterConfig::default()
        };
        assert!(matches!(config.validate(), Err(LwError::Config(_))));
    }

    #[test]
    fn zero_capacities_are_rejected() {
        for mutate in [
            (|c: &mut LazyWriterConfig| c.worker_count = 0) as fn(&mut LazyWriterConfig),
            |c| c.work_entry_limit = 0,
            |c| c.dirty_page_target = 0,
            |c| c.max_write_behind_pages = 0,
        ] {
            let mut config = LazyWriterConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(LwError::Config(_))));
        }
    }

    #[test]
    fn flags_default_to_empty() {
        assert_eq!(StreamFlags::default(), StreamFlags::empty());
        let mut flags = StreamFlags::WRITE_QUEUED | StreamFlags::TEMPORARY_FILE;
        assert!(flags.intersects(StreamFlags::WRITE_QUEUED | StreamFlags::IS_CURSOR));
        flags.remove(StreamFlags::WRITE_QUEUED);
        assert_eq!(flags, StreamFlags::TEMPORARY_FILE);
    }
}
