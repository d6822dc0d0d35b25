//! The "explicit audio disabled guard with guaranteed re-enable on all exit
//! paths" called for by spec §9's design notes, covering the Save/Load/
//! SetLength bracket from §4.2/§5.
//!
//! While paused, [`crate::controller::LooperController::process`] zeroes its
//! output and returns before touching either engine's mutex — the audio
//! thread never blocks on the storage I/O that Save/Load/SetLength perform.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct AudioPause {
    paused: AtomicBool,
}

impl AudioPause {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Pause the audio thread until the returned guard is dropped.
    pub fn pause(&self) -> PauseGuard<'_> {
        self.paused.store(true, Ordering::Release);
        PauseGuard { pause: self }
    }
}

pub struct PauseGuard<'a> {
    pause: &'a AudioPause,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.pause.paused.store(false, Ordering::Release);
    }
}
