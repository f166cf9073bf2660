//! Crash injection for testing checkpoint recovery.
//!
//! A [`CrashInjector`] counts the calls a checkpoint makes against the index
//! file and reports when the configured [`CrashPoint`] is reached. A test
//! storage wrapper consults it and fails the call instead of performing it,
//! after which the test abandons the database and reopens the files.
//!
//! # Crash Points
//!
//! A checkpoint makes these calls against the index file, in order:
//!
//! ```text
//! append nodes → sync → write secondary slot → sync → flip selector → sync
//!      ↑          ↑              ↑              ↑            ↑          ↑
//! DuringNodeWrite │        BeforeSlotWrite      │   BeforeSelectorFlip  │
//!           BeforeNodeSync                BeforeSlotSync         BeforeFinalSync
//! ```
//!
//! Only a crash at [`CrashPoint::BeforeFinalSync`] leaves the new checkpoint
//! selected; every earlier point must recover to the previous one.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Points in the checkpoint sequence where a crash can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Fail an index append once `threshold` appends have succeeded.
    ///
    /// Some nodes of the new checkpoint are written, the header is untouched.
    DuringNodeWrite {
        /// Appends allowed before the failing one.
        threshold: u32,
    },

    /// Fail the sync that follows the node writes.
    BeforeNodeSync,

    /// Fail the header write that fills the secondary slot.
    BeforeSlotWrite,

    /// Fail the sync after the secondary slot was written.
    ///
    /// The secondary slot may be valid on disk but is not selected.
    BeforeSlotSync,

    /// Fail the header write that flips the selector.
    BeforeSelectorFlip,

    /// Fail the sync after the selector was flipped.
    ///
    /// The flipped header already reached the file, so recovery sees the new
    /// checkpoint.
    BeforeFinalSync,
}

impl CrashPoint {
    /// Every crash point, with a node-write threshold of one.
    pub const ALL: [CrashPoint; 6] = [
        CrashPoint::DuringNodeWrite { threshold: 1 },
        CrashPoint::BeforeNodeSync,
        CrashPoint::BeforeSlotWrite,
        CrashPoint::BeforeSlotSync,
        CrashPoint::BeforeSelectorFlip,
        CrashPoint::BeforeFinalSync,
    ];

    /// Whether recovery after this crash should see the interrupted checkpoint.
    #[must_use]
    pub fn survives_checkpoint(self) -> bool {
        matches!(self, CrashPoint::BeforeFinalSync)
    }
}

/// Tracks crash injection state for deterministic crash simulation.
///
/// All state is atomic, so an injector can be shared between the storage
/// wrapper and the test body.
#[derive(Debug)]
pub struct CrashInjector {
    crash_point: CrashPoint,
    sync_count: AtomicU32,
    header_write_count: AtomicU32,
    append_count: AtomicU32,
    crashed: AtomicBool,
    armed: AtomicBool,
}

impl CrashInjector {
    /// Creates a disarmed injector targeting the specified crash point.
    pub fn new(crash_point: CrashPoint) -> Arc<Self> {
        Arc::new(Self {
            crash_point,
            sync_count: AtomicU32::new(0),
            header_write_count: AtomicU32::new(0),
            append_count: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    /// Resets the counters and arms the injector.
    ///
    /// Injectors start disarmed so a test can create the database and load
    /// data without interference.
    pub fn arm(&self) {
        self.sync_count.store(0, Ordering::SeqCst);
        self.header_write_count.store(0, Ordering::SeqCst);
        self.append_count.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarms the injector.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Whether the crash has been triggered.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// The configured crash point.
    pub fn crash_point(&self) -> CrashPoint {
        self.crash_point
    }

    /// Records a sync of the index file. Returns `true` if it should fail.
    pub fn on_sync(&self) -> bool {
        self.observe(&self.sync_count, |point, count| match point {
            CrashPoint::BeforeNodeSync => count == 0,
            CrashPoint::BeforeSlotSync => count == 1,
            CrashPoint::BeforeFinalSync => count == 2,
            _ => false,
        })
    }

    /// Records a header write. Returns `true` if it should fail.
    pub fn on_header_write(&self) -> bool {
        self.observe(&self.header_write_count, |point, count| match point {
            CrashPoint::BeforeSlotWrite => count == 0,
            CrashPoint::BeforeSelectorFlip => count == 1,
            _ => false,
        })
    }

    /// Records an append to the index file. Returns `true` if it should fail.
    pub fn on_append(&self) -> bool {
        self.observe(&self.append_count, |point, count| match point {
            CrashPoint::DuringNodeWrite { threshold } => count >= threshold,
            _ => false,
        })
    }

    /// Number of syncs observed since arming.
    pub fn sync_count(&self) -> u32 {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Number of header writes observed since arming.
    pub fn header_write_count(&self) -> u32 {
        self.header_write_count.load(Ordering::SeqCst)
    }

    fn observe(&self, counter: &AtomicU32, fires: impl Fn(CrashPoint, u32) -> bool) -> bool {
        if !self.armed.load(Ordering::SeqCst) || self.crashed.load(Ordering::SeqCst) {
            return false;
        }
        let count = counter.fetch_add(1, Ordering::SeqCst);
        let crash = fires(self.crash_point, count);
        if crash {
            self.crashed.store(true, Ordering::SeqCst);
        }
        crash
    }
}
