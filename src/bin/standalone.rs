//! The standalone pedal simulator: opens a real audio device via
//! `nih_plug`'s `standalone` feature, the closest stand-in this ecosystem
//! has for "a pedal you can plug a guitar into" (`SPEC_FULL.md` §0).

use nih_plug::wrapper::standalone::nih_export_standalone;
use polyloop_dejavu::PolyloopDejavu;

fn main() {
    nih_export_standalone::<PolyloopDejavu>();
}
