//! Parameters (spec §4.2 "raw 10-bit parameter + dedicated scaling
//! function"). `nih_plug`'s own `FloatRange`/`IntRange`/`EnumParam` realize
//! that model directly for every parameter except `SetLength`, whose
//! domain depends on `SetLengthMode` — that one keeps a hand-rolled
//! scaling function, mirrored from the original firmware's
//! `GetScaledParameter` (`examples/original_source/src/ControllerDejaVu.h`).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nih_plug::prelude::*;

/// Mirrors `ParameterDejaVu.h`'s `Parameter` enum order, for anyone
/// cross-referencing the original firmware's CC map.
#[derive(Enum, PartialEq, Debug, Clone, Copy)]
pub enum SetLengthMode {
    Beats,
    Bars,
    Seconds,
}

#[derive(Params)]
pub struct LooperParams {
    /// Momentary Record button edge (spec §4.2 "Record/(stop)").
    #[id = "record"]
    pub record: BoolParam,

    /// Momentary Overdub button edge (spec §4.2 "Overdub").
    #[id = "overdub"]
    pub overdub: BoolParam,

    /// Momentary Play/Stop button edge (spec §4.2 "PlayStop").
    #[id = "play-stop"]
    pub play_stop: BoolParam,

    /// Display-only: spec.md's Non-goals exclude codec gain application, so
    /// this parameter is scaled and shown exactly as the original firmware
    /// does, but has no effect on the processed signal.
    #[id = "in-gain"]
    pub in_gain: FloatParam,

    #[id = "out-gain"]
    pub out_gain: FloatParam,

    /// Selects which slot `save_trigger`/`load_trigger` act on.
    #[id = "save-slot"]
    pub save_slot: IntParam,

    #[id = "load-slot"]
    pub load_slot: IntParam,

    /// Momentary edge: commits the live loop to `save_slot` (spec §4.2
    /// "save(slot)").
    #[id = "save-trigger"]
    pub save_trigger: BoolParam,

    /// Momentary edge: restores `load_slot` into the live loop (spec §4.2
    /// "load(slot)").
    #[id = "load-trigger"]
    pub load_trigger: BoolParam,

    /// Momentary edge: arms a silent loop sized by `set_length`/
    /// `set_length_mode` (spec §4.2 "SetLength").
    #[id = "set-length-trigger"]
    pub set_length_trigger: BoolParam,

    #[id = "set-length-mode"]
    pub set_length_mode: EnumParam<SetLengthMode>,

    /// Raw 0..=1023 value; [`scale_set_length_samples`] converts it using
    /// the current [`Self::set_length_mode`] and the host's tempo/sample
    /// rate. The formatter mirrors [`Self::set_length_mode`] into
    /// `mode_mirror` because `nih_plug` formatter closures can't borrow
    /// sibling parameters.
    #[id = "set-length"]
    pub set_length: IntParam,

    #[id = "bpm"]
    pub bpm: FloatParam,
}

/// `0` = Beats, `1` = Bars, `2` = Seconds (matches [`SetLengthMode`]'s
/// `Enum` discriminants). Shared between `set_length_mode`'s callback and
/// `set_length`'s formatter.
fn mode_mirror() -> Arc<AtomicU8> {
    Arc::new(AtomicU8::new(SetLengthMode::Beats as u8))
}

impl Default for LooperParams {
    fn default() -> Self {
        let mirror = mode_mirror();
        let mirror_for_mode = mirror.clone();
        let mirror_for_format = mirror.clone();
        let mirror_for_parse = mirror;

        Self {
            record: BoolParam::new("Record", false),
            overdub: BoolParam::new("Overdub", false),
            play_stop: BoolParam::new("Play/Stop", false),

            // spec §4.2: "InGain -> dB in [0, 20], 0.5 dB increments".
            in_gain: FloatParam::new(
                "In Gain",
                util::db_to_gain(0.0),
                FloatRange::Linear {
                    min: util::db_to_gain(0.0),
                    max: util::db_to_gain(20.0),
                },
            )
            .with_step_size(0.5)
            .with_unit(" dB")
            .with_value_to_string(formatters::v2s_f32_gain_to_db(1))
            .with_string_to_value(formatters::s2v_f32_gain_to_db()),

            // spec §4.2: "OutGain -> dB in [-20, +20]; applied as linear gain
            // after engine output".
            out_gain: FloatParam::new(
                "Out Gain",
                util::db_to_gain(0.0),
                FloatRange::Skewed {
                    min: util::db_to_gain(-20.0),
                    max: util::db_to_gain(20.0),
                    factor: FloatRange::gain_skew_factor(-20.0, 20.0),
                },
            )
            .with_smoother(SmoothingStyle::Linear(20.0))
            .with_unit(" dB")
            .with_value_to_string(formatters::v2s_f32_gain_to_db(1))
            .with_string_to_value(formatters::s2v_f32_gain_to_db()),

            // spec §4.2: "LoadSlot, SaveSlot -> integer slot in [1, 30]".
            save_slot: IntParam::new("Save Slot", 1, IntRange::Linear { min: 1, max: 30 }),
            load_slot: IntParam::new("Load Slot", 1, IntRange::Linear { min: 1, max: 30 }),
            save_trigger: BoolParam::new("Save", false),
            load_trigger: BoolParam::new("Load", false),
            set_length_trigger: BoolParam::new("Set Length", false),

            set_length_mode: EnumParam::new("Length Mode", SetLengthMode::Beats).with_callback(
                Arc::new(move |mode| {
                    mirror_for_mode.store(mode as u8, Ordering::Relaxed);
                }),
            ),

            set_length: IntParam::new("Length", 256, IntRange::Linear { min: 0, max: 1023 })
                .with_value_to_string(Arc::new(move |raw| {
                    let mode = set_length_mode_from_u8(mirror_for_format.load(Ordering::Relaxed));
                    format_set_length(raw, mode)
                }))
                .with_string_to_value(Arc::new(move |text| {
                    let mode = set_length_mode_from_u8(mirror_for_parse.load(Ordering::Relaxed));
                    parse_set_length(text, mode)
                })),

            // spec §4.2: "Bpm -> integer in [10, 300]".
            bpm: FloatParam::new("Tempo", 120.0, FloatRange::Linear { min: 10.0, max: 300.0 })
                .with_step_size(1.0)
                .with_unit(" BPM")
                .with_value_to_string(formatters::v2s_f32_rounded(1)),
        }
    }
}

fn set_length_mode_from_u8(raw: u8) -> SetLengthMode {
    match raw {
        0 => SetLengthMode::Beats,
        1 => SetLengthMode::Bars,
        _ => SetLengthMode::Seconds,
    }
}

/// Raw `0..=1023` to seconds (spec §4.2 "SetLength depends on
/// SetLengthMode: Seconds..."): the lower half of the raw range covers
/// `[3.0, 30.0]` in `0.1s` steps, the upper half covers `(30, 120]` in
/// `1s` steps. Flagged by spec §9 as non-monotone at the midpoint (both
/// halves agree on `30.0` there) — carried verbatim, not "fixed".
const SECONDS_SPLIT_RAW: i32 = 511;
const SECONDS_FINE_MIN: f32 = 3.0;
const SECONDS_FINE_MAX: f32 = 30.0;
const SECONDS_COARSE_MAX: f32 = 120.0;

fn raw_to_seconds(raw: i32) -> f32 {
    if raw <= SECONDS_SPLIT_RAW {
        let t = raw as f32 / SECONDS_SPLIT_RAW as f32;
        let steps = ((SECONDS_FINE_MAX - SECONDS_FINE_MIN) / 0.1).round();
        SECONDS_FINE_MIN + (t * steps).round() * 0.1
    } else {
        let t = (raw - SECONDS_SPLIT_RAW) as f32 / (1023 - SECONDS_SPLIT_RAW) as f32;
        let steps = (SECONDS_COARSE_MAX - SECONDS_FINE_MAX).round();
        SECONDS_FINE_MAX + (t * steps).round()
    }
}

fn seconds_to_raw(seconds: f32) -> i32 {
    if seconds <= SECONDS_FINE_MAX {
        let t = (seconds - SECONDS_FINE_MIN) / (SECONDS_FINE_MAX - SECONDS_FINE_MIN);
        (t * SECONDS_SPLIT_RAW as f32).round() as i32
    } else {
        let t = (seconds - SECONDS_FINE_MAX) / (SECONDS_COARSE_MAX - SECONDS_FINE_MAX);
        SECONDS_SPLIT_RAW + (t * (1023 - SECONDS_SPLIT_RAW) as f32).round() as i32
    }
    .clamp(0, 1023)
}

// spec §4.2: "Beats: integer [1, 128]", "Bars: integer [1, 16], assuming
// 4/4 time".
const MAX_BEATS: i32 = 128;
const MAX_BARS: i32 = 16;

fn format_set_length(raw: i32, mode: SetLengthMode) -> String {
    match mode {
        SetLengthMode::Beats => {
            let beats = 1 + raw * (MAX_BEATS - 1) / 1023;
            format!("{beats} beats")
        }
        SetLengthMode::Bars => {
            let bars = 1 + raw * (MAX_BARS - 1) / 1023;
            format!("{bars} bars")
        }
        SetLengthMode::Seconds => format!("{:.1} sec", raw_to_seconds(raw)),
    }
}

fn parse_set_length(text: &str, mode: SetLengthMode) -> Option<i32> {
    let numeric: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    match mode {
        SetLengthMode::Beats => {
            let beats: i32 = numeric.parse().ok()?;
            Some(((beats - 1) * 1023 / (MAX_BEATS - 1)).clamp(0, 1023))
        }
        SetLengthMode::Bars => {
            let bars: i32 = numeric.parse().ok()?;
            Some(((bars - 1) * 1023 / (MAX_BARS - 1)).clamp(0, 1023))
        }
        SetLengthMode::Seconds => {
            let seconds: f32 = numeric.parse().ok()?;
            Some(seconds_to_raw(seconds))
        }
    }
}

/// Number of parameters in the persisted vector (spec §6): `InGain, OutGain,
/// LoadSlot, SaveSlot, SetLength, SetLengthMode, Bpm`, in `ParameterDejaVu.h`'s
/// enum order. The momentary triggers (Record/Overdub/PlayStop/Save/Load/
/// SetLength) aren't part of it — the original firmware doesn't persist
/// those either.
pub const PARAMETER_COUNT: usize = 7;

fn raw10_from_linear(value: f32, min: f32, max: f32) -> u16 {
    (((value - min) / (max - min)).clamp(0.0, 1.0) * 1023.0).round() as u16
}

fn linear_from_raw10(raw: u16, min: f32, max: f32) -> f32 {
    min + (f32::from(raw) / 1023.0) * (max - min)
}

/// Packs the seven persisted parameters into raw `0..=1023` values (spec §6
/// "Parameter persistence"), in `ParameterDejaVu.h`'s `Parameter` enum order.
pub fn raw_vector(params: &LooperParams) -> [u16; PARAMETER_COUNT] {
    [
        raw10_from_linear(util::gain_to_db(params.in_gain.value()), 0.0, 20.0),
        raw10_from_linear(util::gain_to_db(params.out_gain.value()), -20.0, 20.0),
        raw10_from_linear(params.load_slot.value() as f32, 1.0, 30.0),
        raw10_from_linear(params.save_slot.value() as f32, 1.0, 30.0),
        params.set_length.value().clamp(0, 1023) as u16,
        params.set_length_mode.value() as u8 as u16,
        raw10_from_linear(params.bpm.value(), 10.0, 300.0),
    ]
}

/// Inverse of [`raw_vector`]: restores a previously persisted raw vector
/// onto `params` (spec §6: "restored on start"). Ignores a short or absent
/// vector rather than panicking, since a missing `settings.bin` on first
/// run is the common case.
pub fn apply_raw_vector(params: &LooperParams, raw: &[u16]) {
    if raw.len() < PARAMETER_COUNT {
        return;
    }
    params
        .in_gain
        .set_plain_value(util::db_to_gain(linear_from_raw10(raw[0], 0.0, 20.0)));
    params
        .out_gain
        .set_plain_value(util::db_to_gain(linear_from_raw10(raw[1], -20.0, 20.0)));
    params
        .load_slot
        .set_plain_value(linear_from_raw10(raw[2], 1.0, 30.0).round() as i32);
    params
        .save_slot
        .set_plain_value(linear_from_raw10(raw[3], 1.0, 30.0).round() as i32);
    params.set_length.set_plain_value(i32::from(raw[4]));
    params
        .set_length_mode
        .set_plain_value(set_length_mode_from_u8(raw[5] as u8));
    params.bpm.set_plain_value(linear_from_raw10(raw[6], 10.0, 300.0));
}

/// Converts the current `set_length`/`set_length_mode`/`bpm` parameter
/// values into a sample count, for [`crate::controller::Trigger::SetLength`]
/// (spec §4.2 "SetLength"). This is the "dedicated scaling function" the
/// raw 10-bit `set_length` parameter exists to feed.
pub fn scale_set_length_samples(params: &LooperParams, samplerate: f32) -> usize {
    let raw = params.set_length.value();
    let mode = params.set_length_mode.value();
    let seconds = match mode {
        SetLengthMode::Beats => {
            let beats = (1 + raw * (MAX_BEATS - 1) / 1023) as f32;
            beats * (60.0 / params.bpm.value())
        }
        SetLengthMode::Bars => {
            let bars = (1 + raw * (MAX_BARS - 1) / 1023) as f32;
            bars * 4.0 * (60.0 / params.bpm.value())
        }
        SetLengthMode::Seconds => raw_to_seconds(raw),
    };
    (seconds * samplerate).round().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_split_is_finer_below_ten_seconds() {
        let fine_step = raw_to_seconds(1) - raw_to_seconds(0);
        let coarse_step = raw_to_seconds(1023) - raw_to_seconds(1022);
        assert!(fine_step < coarse_step);
    }

    #[test]
    fn seconds_round_trips_through_raw() {
        for raw in [0, 100, SECONDS_SPLIT_RAW, 900, 1023] {
            let seconds = raw_to_seconds(raw);
            let back = seconds_to_raw(seconds);
            assert!((back - raw).abs() <= 1, "{raw} -> {seconds} -> {back}");
        }
    }

    #[test]
    fn beats_mode_scales_with_bpm() {
        let params = LooperParams::default();
        params.set_length_mode.set_plain_value(SetLengthMode::Beats);
        params.set_length.set_plain_value(1023);
        params.bpm.set_plain_value(120.0);
        let samples_120 = scale_set_length_samples(&params, 48_000.0);
        params.bpm.set_plain_value(60.0);
        let samples_60 = scale_set_length_samples(&params, 48_000.0);
        assert!(samples_60 > samples_120);
    }

    #[test]
    fn raw_vector_round_trips_through_apply() {
        let params = LooperParams::default();
        params.in_gain.set_plain_value(util::db_to_gain(12.5));
        params.out_gain.set_plain_value(util::db_to_gain(-6.0));
        params.load_slot.set_plain_value(17);
        params.save_slot.set_plain_value(4);
        params.set_length.set_plain_value(640);
        params.set_length_mode.set_plain_value(SetLengthMode::Bars);
        params.bpm.set_plain_value(90.0);

        let raw = raw_vector(&params);

        let restored = LooperParams::default();
        apply_raw_vector(&restored, &raw);

        assert!((util::gain_to_db(restored.in_gain.value()) - 12.5).abs() < 0.1);
        assert!((util::gain_to_db(restored.out_gain.value()) - (-6.0)).abs() < 0.1);
        assert_eq!(restored.load_slot.value(), 17);
        assert_eq!(restored.save_slot.value(), 4);
        assert_eq!(restored.set_length.value(), 640);
        assert_eq!(restored.set_length_mode.value(), SetLengthMode::Bars);
        assert!((restored.bpm.value() - 90.0).abs() < 0.5);
    }

    #[test]
    fn apply_raw_vector_ignores_short_input() {
        let params = LooperParams::default();
        let before = params.bpm.value();
        apply_raw_vector(&params, &[0, 1, 2]);
        assert_eq!(params.bpm.value(), before);
    }
}
