//! Fixed sizes shared by every module. See spec §3 "Data model".

/// Samples per storage block (`S`). Every I/O op is rounded up to a whole
/// number of these; the storage ceiling itself need not be an exact
/// multiple (callers round up via `blocks_for`/`storage_area`).
pub const STORAGE_BLOCK_SAMPLES: usize = 4096;

/// Hard ceiling on loop length, in samples per channel (`F`). This is the
/// exact size `file.preAllocate(17280000)` reserves in the original firmware
/// (17_280_000 bytes / 4 bytes-per-f32 = 4_320_000 samples), ~90s at 48kHz.
pub const STORAGE_CEILING_SAMPLES: usize = 4_320_000;

/// Number of channels the controller composes (stereo only, per spec §1).
pub const NUM_CHANNELS: usize = 2;

/// Capacity of each SPSC I/O ring (spec §3: "capacity ≥3").
pub const IO_QUEUE_CAPACITY: usize = 4;

static_assertions::const_assert!(STORAGE_CEILING_SAMPLES >= STORAGE_BLOCK_SAMPLES);
static_assertions::const_assert!(IO_QUEUE_CAPACITY >= 3);
