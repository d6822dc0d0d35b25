#![allow(clippy::items_after_statements)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

use nih_plug::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

pub mod constants;
pub mod controller;
pub mod engine;
pub mod error;
pub mod params;
pub mod pause;
pub mod storage;

use constants::NUM_CHANNELS;
use controller::{LooperController, Trigger};
use params::LooperParams;

/// Input/output clip counters decay to `0` over this many blocks once the
/// triggering threshold is no longer crossed (verbatim from the original
/// firmware's `AudioCallback`; `SPEC_FULL.md` §3).
const CLIP_DECAY_BLOCKS: u32 = 2000;
const INPUT_CLIP_THRESHOLD: f32 = 0.88;
const OUTPUT_CLIP_THRESHOLD: f32 = 0.98;

pub struct PolyloopDejavu {
    params: Arc<LooperParams>,
    controller: Option<LooperController>,
    samplerate: f32,

    prev_record: bool,
    prev_overdub: bool,
    prev_play_stop: bool,
    prev_save_trigger: bool,
    prev_load_trigger: bool,
    prev_set_length_trigger: bool,

    /// Baseline for settings-dirty detection (spec §6): `None` until
    /// `initialize` establishes it, so the first block after startup never
    /// spuriously re-saves what was just loaded.
    prev_persisted_params: Option<[u16; params::PARAMETER_COUNT]>,

    input_clip: u32,
    output_clip: u32,
}

impl Default for PolyloopDejavu {
    fn default() -> Self {
        Self {
            params: Arc::new(LooperParams::default()),
            controller: None,
            samplerate: 48_000.0,
            prev_record: false,
            prev_overdub: false,
            prev_play_stop: false,
            prev_save_trigger: false,
            prev_load_trigger: false,
            prev_set_length_trigger: false,
            prev_persisted_params: None,
            input_clip: 0,
            output_clip: 0,
        }
    }
}

/// Where the live loop and slot files live. Overridable for running
/// several instances side by side; falls back to a plain temp-dir
/// location since, unlike the original firmware's on-board flash, a
/// desktop host has no single obvious place for this.
fn resolve_data_dir() -> PathBuf {
    std::env::var_os("POLYLOOP_DEJAVU_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("polyloop-dejavu"))
}

impl PolyloopDejavu {
    /// Detects edges on the momentary transport/slot/length triggers and
    /// forwards them to the Main context (spec §4.2). Runs once per block;
    /// momentary footswitch presses don't need sample-accurate resolution.
    fn poll_triggers(&mut self, controller: &mut LooperController) {
        let record = self.params.record.value();
        if record && !self.prev_record {
            controller.push_trigger(Trigger::Record);
        }
        self.prev_record = record;

        let overdub = self.params.overdub.value();
        if overdub && !self.prev_overdub {
            controller.push_trigger(Trigger::Overdub);
        }
        self.prev_overdub = overdub;

        let play_stop = self.params.play_stop.value();
        if play_stop && !self.prev_play_stop {
            controller.push_trigger(Trigger::PlayStop);
        }
        self.prev_play_stop = play_stop;

        let save_trigger = self.params.save_trigger.value();
        if save_trigger && !self.prev_save_trigger {
            controller.push_trigger(Trigger::Save(self.params.save_slot.value() as u8));
        }
        self.prev_save_trigger = save_trigger;

        let load_trigger = self.params.load_trigger.value();
        if load_trigger && !self.prev_load_trigger {
            controller.push_trigger(Trigger::Load(self.params.load_slot.value() as u8));
        }
        self.prev_load_trigger = load_trigger;

        let set_length_trigger = self.params.set_length_trigger.value();
        if set_length_trigger && !self.prev_set_length_trigger {
            let samples = params::scale_set_length_samples(&self.params, self.samplerate);
            controller.push_trigger(Trigger::SetLength(samples as u32));
        }
        self.prev_set_length_trigger = set_length_trigger;
    }

    /// Pushes `SaveSettings` whenever the persisted parameter vector (spec
    /// §6) has changed since the last block, mirroring the original
    /// firmware's `settingsDirty` flag. The actual file write happens on
    /// the Main context, never on this (audio) thread.
    fn poll_settings_dirty(&mut self, controller: &mut LooperController) {
        let current = params::raw_vector(&self.params);
        if self.prev_persisted_params != Some(current) {
            controller.push_trigger(Trigger::SaveSettings(current));
            self.prev_persisted_params = Some(current);
        }
    }

    /// Block-countdown clip meters (spec §4.3's "decaying clip flags",
    /// disambiguated by `examples/original_source/src/DejaVu.h`'s
    /// `AudioCallback`: a hold-then-linear-decrement counter, not an
    /// exponential smoother).
    fn update_clip_meters(&mut self, max_in: f32, max_out: f32) {
        self.input_clip = if max_in >= INPUT_CLIP_THRESHOLD {
            CLIP_DECAY_BLOCKS
        } else {
            self.input_clip.saturating_sub(1)
        };
        self.output_clip = if max_out >= OUTPUT_CLIP_THRESHOLD {
            CLIP_DECAY_BLOCKS
        } else {
            self.output_clip.saturating_sub(1)
        };
    }
}

impl Plugin for PolyloopDejavu {
    const NAME: &'static str = "Polyloop DejaVu";
    const VENDOR: &'static str = "GhostNote Audio";
    const URL: &'static str = env!("CARGO_PKG_HOMEPAGE");
    const EMAIL: &'static str = "support@ghostnoteaudio.example";

    const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    const AUDIO_IO_LAYOUTS: &'static [AudioIOLayout] = &[AudioIOLayout {
        main_input_channels: NonZeroU32::new(NUM_CHANNELS as u32),
        main_output_channels: NonZeroU32::new(NUM_CHANNELS as u32),
        ..AudioIOLayout::const_default()
    }];

    const MIDI_INPUT: MidiConfig = MidiConfig::None;
    const MIDI_OUTPUT: MidiConfig = MidiConfig::None;

    const SAMPLE_ACCURATE_AUTOMATION: bool = false;

    type SysExMessage = ();
    type BackgroundTask = ();

    fn params(&self) -> Arc<dyn Params> {
        self.params.clone()
    }

    fn initialize(
        &mut self,
        _audio_io_layout: &AudioIOLayout,
        buffer_config: &BufferConfig,
        context: &mut impl InitContext<Self>,
    ) -> bool {
        self.samplerate = buffer_config.sample_rate;

        let data_dir = resolve_data_dir();
        // spec §6 "restored on start": load the persisted parameter vector,
        // if one exists, before the controller starts driving the engines.
        if let Some(raw) = storage::load_parameter_vector(
            controller::settings_path(&data_dir),
            params::PARAMETER_COUNT,
        ) {
            params::apply_raw_vector(&self.params, &raw);
        }
        self.prev_persisted_params = Some(params::raw_vector(&self.params));

        match controller::build(data_dir) {
            Ok(handles) => {
                self.controller = Some(handles.controller);
                // Main context (SPEC_FULL.md §0): pumps storage I/O and
                // executes Save/Load/SetLength off the audio thread.
                std::thread::spawn(move || handles.main_context.run_forever());
            }
            Err(err) => {
                nih_error!("failed to initialize loop storage: {err}");
                return false;
            }
        }

        context.set_latency_samples(0);
        true
    }

    fn reset(&mut self) {
        self.prev_record = false;
        self.prev_overdub = false;
        self.prev_play_stop = false;
        self.prev_save_trigger = false;
        self.prev_load_trigger = false;
        self.prev_set_length_trigger = false;
        self.input_clip = 0;
        self.output_clip = 0;
    }

    fn process(
        &mut self,
        buffer: &mut Buffer,
        _aux: &mut AuxiliaryBuffers,
        _context: &mut impl ProcessContext<Self>,
    ) -> ProcessStatus {
        let Some(controller) = self.controller.as_mut() else {
            return ProcessStatus::Error("loop storage failed to initialize");
        };

        self.poll_triggers(controller);
        self.poll_settings_dirty(controller);

        let channels = buffer.as_slice();
        let (left_half, right_half) = channels.split_at_mut(1);
        let left = &mut left_half[0];
        let right = &mut right_half[0];

        let max_in = left
            .iter()
            .chain(right.iter())
            .fold(0.0f32, |acc, &s| acc.max(s.abs()));

        controller.process(left, right);

        for i in 0..left.len() {
            let gain = self.params.out_gain.smoothed.next();
            left[i] *= gain;
            right[i] *= gain;
        }

        let max_out = left
            .iter()
            .chain(right.iter())
            .fold(0.0f32, |acc, &s| acc.max(s.abs()));
        self.update_clip_meters(max_in, max_out);

        ProcessStatus::Normal
    }
}

impl ClapPlugin for PolyloopDejavu {
    const CLAP_ID: &'static str = "com.ghostnoteaudio.polyloop-dejavu";
    const CLAP_DESCRIPTION: Option<&'static str> =
        Some("Stereo looper pedal: record, overdub and loop playback over streaming storage");
    const CLAP_MANUAL_URL: Option<&'static str> = Some(Self::URL);
    const CLAP_SUPPORT_URL: Option<&'static str> = None;

    const CLAP_FEATURES: &'static [ClapFeature] = &[ClapFeature::AudioEffect, ClapFeature::Stereo];
}

impl Vst3Plugin for PolyloopDejavu {
    const VST3_CLASS_ID: [u8; 16] = *b"ghostnoteplyloop";

    const VST3_SUBCATEGORIES: &'static [Vst3SubCategory] =
        &[Vst3SubCategory::Fx, Vst3SubCategory::Tools];
}

nih_export_clap!(PolyloopDejavu);
nih_export_vst3!(PolyloopDejavu);
