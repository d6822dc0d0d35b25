//! Error taxonomy from spec §7. Audio-thread code never constructs these —
//! it only increments the counters in [`crate::engine::ErrorCounters`]; these
//! are surfaced exclusively from Main-context calls (`init`, `save`, `load`,
//! `set_total_length`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LooperError {
    #[error("storage backend unavailable: {0}")]
    ResourceInit(#[source] std::io::Error),

    #[error("slot {0} is empty")]
    SlotMissing(u32),

    #[error("slot {0} is corrupt")]
    SlotCorrupt(u32),

    #[error("storage write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("storage read failed: {0}")]
    ReadFailed(#[source] std::io::Error),
}

/// Result of [`crate::controller::LooperController::load`] (spec §4.2:
/// "Returns one of `{ok, empty, error}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Ok,
    Empty,
    Error,
}
