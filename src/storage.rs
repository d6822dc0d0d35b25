//! The storage layer. Spec §1 treats the actual flash/SD random-access API
//! as an out-of-scope external collaborator, specified only at its
//! interface; [`LoopStorage`] is that interface, and [`FileLoopStorage`] is
//! the one concrete backend this crate ships (a plain file standing in for
//! the SD card, since that's the medium every desktop host this crate runs
//! on actually has). Slot persistence (spec §4.2 "Persistence (slots)") and
//! parameter-vector persistence (spec §6) are free functions below, since
//! both operate on whole files in one Main-thread shot rather than through
//! the streaming block interface.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::constants::STORAGE_BLOCK_SAMPLES as S;
use crate::error::LooperError;

fn sample_offset_to_byte(sample_offset: usize) -> u64 {
    (sample_offset * std::mem::size_of::<f32>()) as u64
}

/// A random-access, block-granular store for one channel's live loop.
///
/// Implementors back [`crate::engine::PumpWorker`]; every method here runs
/// on the Main context only, never the audio thread.
pub trait LoopStorage: Send {
    fn read_block(&mut self, sample_offset: usize, out: &mut [f32; S]) -> Result<(), LooperError>;
    fn write_block(&mut self, sample_offset: usize, data: &[f32; S]) -> Result<(), LooperError>;
}

/// A single flat file of little-endian `f32` samples, pre-allocated to
/// [`crate::constants::STORAGE_CEILING_SAMPLES`] (spec §6, "Live loop
/// file").
pub struct FileLoopStorage {
    file: File,
}

impl FileLoopStorage {
    /// Opens (creating if necessary) and pre-allocates the backing file.
    pub fn open_or_create(path: impl AsRef<Path>, ceiling_samples: usize) -> Result<Self, LooperError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(LooperError::ResourceInit)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(LooperError::ResourceInit)?;
        let ceiling_bytes = sample_offset_to_byte(ceiling_samples);
        if file.metadata().map_err(LooperError::ResourceInit)?.len() < ceiling_bytes {
            file.set_len(ceiling_bytes)
                .map_err(LooperError::ResourceInit)?;
        }
        Ok(Self { file })
    }

    /// Zero-fills `[0, samples)` — used by `SetLength` (spec §4.2) to arm a
    /// silent loop of known duration.
    pub fn zero_fill(&mut self, samples: usize) -> Result<(), LooperError> {
        let zeros = [0.0f32; S];
        let mut remaining = samples;
        let mut offset = 0usize;
        while remaining > 0 {
            let chunk = remaining.min(S);
            // zero_fill operates on whole blocks; a non-multiple tail is
            // still safe since write_block always writes exactly S samples.
            self.write_block(offset, &zeros)?;
            offset += chunk;
            remaining = remaining.saturating_sub(chunk);
        }
        Ok(())
    }

    /// Copies the first `storage_area` samples into a newly (re)created
    /// slot file, with the two little-endian `u32` header fields from
    /// spec §6 ("Slot file").
    pub fn save_to_slot(
        &mut self,
        slot_path: impl AsRef<Path>,
        loop_length: u32,
        storage_area: u32,
    ) -> Result<(), LooperError> {
        if let Some(parent) = slot_path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(LooperError::WriteFailed)?;
        }
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(slot_path)
            .map_err(LooperError::WriteFailed)?;
        out.write_all(&loop_length.to_le_bytes())
            .map_err(LooperError::WriteFailed)?;
        out.write_all(&storage_area.to_le_bytes())
            .map_err(LooperError::WriteFailed)?;

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(LooperError::ReadFailed)?;
        let mut remaining = storage_area as u64 * 4;
        let mut buf = vec![0u8; S * 4];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            self.file
                .read_exact(&mut buf[..chunk])
                .map_err(LooperError::ReadFailed)?;
            out.write_all(&buf[..chunk]).map_err(LooperError::WriteFailed)?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Inverse of [`Self::save_to_slot`]: overwrites the live file with a
    /// slot's payload. Returns the `(loop_length, storage_area)` recovered
    /// from the slot header. Distinguishes spec §7's `SlotMissing` (no such
    /// slot file) from `SlotCorrupt` (header or body read short) so the
    /// caller can report "Slot is empty" vs. "An error occurred" verbatim.
    pub fn load_from_slot(
        &mut self,
        slot_path: impl AsRef<Path>,
        slot: u32,
    ) -> Result<(u32, u32), LooperError> {
        let mut slot_file = match File::open(slot_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LooperError::SlotMissing(slot))
            }
            Err(e) => return Err(LooperError::ReadFailed(e)),
        };
        let mut header = [0u8; 8];
        if slot_file.read_exact(&mut header).is_err() {
            return Err(LooperError::SlotCorrupt(slot));
        }
        let loop_length = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let storage_area = u32::from_le_bytes(header[4..8].try_into().unwrap());

        let mut body = Vec::new();
        if slot_file.read_to_end(&mut body).is_err() {
            return Err(LooperError::SlotCorrupt(slot));
        }
        if body.len() != storage_area as usize * 4 {
            return Err(LooperError::SlotCorrupt(slot));
        }

        self.file.seek(SeekFrom::Start(0)).map_err(LooperError::ReadFailed)?;
        self.file.write_all(&body).map_err(LooperError::WriteFailed)?;
        Ok((loop_length, storage_area))
    }

    /// Reads back the first two storage blocks, for repopulating
    /// `loop_start_blocks` after a load (spec §4.2 "load(slot)").
    pub fn read_loop_start(&mut self) -> Result<[[f32; S]; 2], LooperError> {
        let mut block0 = [0.0f32; S];
        let mut block1 = [0.0f32; S];
        self.read_block(0, &mut block0)?;
        self.read_block(S, &mut block1)?;
        Ok([block0, block1])
    }
}

impl LoopStorage for FileLoopStorage {
    fn read_block(&mut self, sample_offset: usize, out: &mut [f32; S]) -> Result<(), LooperError> {
        self.file
            .seek(SeekFrom::Start(sample_offset_to_byte(sample_offset)))
            .map_err(LooperError::ReadFailed)?;
        let mut bytes = [0u8; S * 4];
        self.file
            .read_exact(&mut bytes)
            .map_err(LooperError::ReadFailed)?;
        for (sample, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
            *sample = f32::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(())
    }

    fn write_block(&mut self, sample_offset: usize, data: &[f32; S]) -> Result<(), LooperError> {
        self.file
            .seek(SeekFrom::Start(sample_offset_to_byte(sample_offset)))
            .map_err(LooperError::WriteFailed)?;
        let mut bytes = [0u8; S * 4];
        for (chunk, sample) in bytes.chunks_exact_mut(4).zip(data.iter()) {
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        self.file.write_all(&bytes).map_err(LooperError::WriteFailed)?;
        Ok(())
    }
}

/// Parameter-vector persistence (spec §6): 7 raw `u16`s, little-endian, no
/// framing.
pub fn load_parameter_vector(path: impl AsRef<Path>, count: usize) -> Option<Vec<u16>> {
    let mut file = File::open(path).ok()?;
    let mut bytes = vec![0u8; count * 2];
    file.read_exact(&mut bytes).ok()?;
    Some(bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect())
}

pub fn save_parameter_vector(path: impl AsRef<Path>, values: &[u16]) -> Result<(), LooperError> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent).map_err(LooperError::WriteFailed)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(LooperError::WriteFailed)?;
    let mut bytes = Vec::with_capacity(values.len() * 2);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    file.write_all(&bytes).map_err(LooperError::WriteFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileLoopStorage::open_or_create(dir.path().join("live.L"), S * 4).unwrap();
        let mut block = [0.0f32; S];
        for (i, s) in block.iter_mut().enumerate() {
            *s = i as f32 * 0.001;
        }
        storage.write_block(0, &block).unwrap();
        let mut readback = [0.0f32; S];
        storage.read_block(0, &mut readback).unwrap();
        assert_eq!(block, readback);
    }

    #[test]
    fn preallocates_to_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.L");
        let storage = FileLoopStorage::open_or_create(&path, S * 10).unwrap();
        drop(storage);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), (S * 10 * 4) as u64);
    }

    #[test]
    fn save_and_load_slot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileLoopStorage::open_or_create(dir.path().join("live.L"), S * 4).unwrap();
        let mut block = [0.0f32; S];
        for (i, s) in block.iter_mut().enumerate() {
            *s = (i as f32 / S as f32) - 0.5;
        }
        storage.write_block(0, &block).unwrap();
        storage.write_block(S, &block).unwrap();

        let slot_path = dir.path().join("slot7.dat");
        storage
            .save_to_slot(&slot_path, (2 * S) as u32, (2 * S) as u32)
            .unwrap();

        let mut fresh = FileLoopStorage::open_or_create(dir.path().join("live2.L"), S * 4).unwrap();
        let (loop_length, storage_area) = fresh.load_from_slot(&slot_path, 7).unwrap();
        assert_eq!(loop_length, (2 * S) as u32);
        assert_eq!(storage_area, (2 * S) as u32);

        let mut readback = [0.0f32; S];
        fresh.read_block(0, &mut readback).unwrap();
        assert_eq!(readback, block);
    }

    #[test]
    fn load_missing_slot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileLoopStorage::open_or_create(dir.path().join("live.L"), S * 4).unwrap();
        let outcome = storage.load_from_slot(dir.path().join("no-such-slot.dat"), 9);
        assert!(matches!(outcome.unwrap_err(), LooperError::SlotMissing(9)));
    }

    #[test]
    fn load_truncated_slot_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let slot_path = dir.path().join("slot1.dat");
        std::fs::write(&slot_path, [0u8; 4]).unwrap(); // short header
        let mut storage = FileLoopStorage::open_or_create(dir.path().join("live.L"), S * 4).unwrap();
        let outcome = storage.load_from_slot(&slot_path, 1);
        assert!(matches!(outcome.unwrap_err(), LooperError::SlotCorrupt(1)));
    }

    #[test]
    fn parameter_vector_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bin");
        let values: Vec<u16> = vec![512, 512, 1, 7, 300, 0, 120];
        save_parameter_vector(&path, &values).unwrap();
        let loaded = load_parameter_vector(&path, values.len()).unwrap();
        assert_eq!(loaded, values);
    }
}
