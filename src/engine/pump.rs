//! The Main-context half of the I/O pipeline (spec §4.1 "advance_read" /
//! "advance_write", §1 "not parallel threads" — realized here as a single
//! background thread per `SPEC_FULL.md` §0). One [`PumpWorker`] per
//! channel; [`crate::controller::LooperController`] polls both in its
//! background loop.

use std::sync::Arc;

use nih_plug::{nih_error, nih_trace};

use super::{LoopStartBlocks, ReadRequest, ReadResult, WriteOp};
use crate::constants::STORAGE_BLOCK_SAMPLES as S;
use crate::storage::LoopStorage;

/// Owns the Consumer ends of `write_q`/`read_q` and the Producer end of
/// `read_result_q`, plus the actual storage backend. Never touches the
/// engine's mutex — it only exchanges lock-free `rtrb` messages with it.
pub struct PumpWorker {
    write_consumer: rtrb::Consumer<WriteOp>,
    read_req_consumer: rtrb::Consumer<ReadRequest>,
    read_result_producer: rtrb::Producer<ReadResult>,
    storage: Box<dyn LoopStorage>,
    loop_start: Arc<LoopStartBlocks>,
}

impl PumpWorker {
    pub(super) fn new(
        write_consumer: rtrb::Consumer<WriteOp>,
        read_req_consumer: rtrb::Consumer<ReadRequest>,
        read_result_producer: rtrb::Producer<ReadResult>,
        storage: Box<dyn LoopStorage>,
        loop_start: Arc<LoopStartBlocks>,
    ) -> Self {
        Self {
            write_consumer,
            read_req_consumer,
            read_result_producer,
            storage,
            loop_start,
        }
    }

    /// Drains at most one pending write and one pending read request.
    /// Returns whether it did any work, so the background loop can back
    /// off (sleep briefly) when both queues are empty.
    pub fn pump_once(&mut self, storage_area: usize) -> bool {
        let mut did_work = false;

        if let Ok(op) = self.write_consumer.pop() {
            did_work = true;
            if let Err(err) = self.storage.write_block(op.file_offset, &op.payload) {
                nih_error!("loop storage write failed: {err}");
            } else if op.file_offset == 0 || op.file_offset == S {
                self.loop_start.mirror(op.file_offset / S, &op.payload);
            }
        }

        if let Ok(req) = self.read_req_consumer.pop() {
            did_work = true;
            let out_of_range = req.file_offset >= storage_area;
            let payload = if out_of_range {
                // spec §7 OutOfRangeRead: "discarded silently; logged" —
                // the engine still receives a zeroed block so its pipeline
                // stays in lockstep.
                nih_trace!(
                    "loop read past storage_area ({} >= {storage_area}), serving silence",
                    req.file_offset
                );
                [0.0f32; S]
            } else {
                let mut buf = [0.0f32; S];
                match self.storage.read_block(req.file_offset, &mut buf) {
                    Ok(()) => buf,
                    Err(err) => {
                        nih_error!("loop storage read failed: {err}");
                        [0.0f32; S]
                    }
                }
            };
            // A full result ring means the engine has fallen behind its own
            // requests, which can't happen with capacity >= 2 outstanding
            // requests; drop silently rather than block the pump thread.
            let _ = self.read_result_producer.push(ReadResult { payload });
        }

        did_work
    }
}
