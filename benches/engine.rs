use criterion::{black_box, criterion_group, criterion_main, Criterion, SamplingMode};
use polyloop_dejavu::constants::STORAGE_BLOCK_SAMPLES as S;
use polyloop_dejavu::engine::{Mode, RecordingEngine};
use polyloop_dejavu::storage::FileLoopStorage;

fn build_recording_engine(dir: &std::path::Path) -> RecordingEngine {
    let storage = FileLoopStorage::open_or_create(dir.join("bench.live"), S * 64).unwrap();
    let handles = RecordingEngine::new(4, Box::new(storage));
    // The pump never runs in this benchmark; the write queue fills and
    // overflows into a counter rather than blocking, which is exactly the
    // allocation-free, lock-only-contention behavior being measured.
    std::mem::forget(handles.pump);
    handles.engine
}

fn bench_process_block(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_recording_engine(dir.path());
    engine.set_mode(Mode::Recording);

    let mut group = c.benchmark_group("engine process_block");
    group.sample_size(200).sampling_mode(SamplingMode::Linear);

    group.bench_function("recording, 64 samples", |b| {
        let mut buf = [0.3f32; 64];
        b.iter(|| {
            engine.process_block(black_box(&mut buf));
        })
    });

    group.finish();
}

fn bench_playback(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_recording_engine(dir.path());
    engine.set_mode(Mode::Recording);
    let mut buf = [0.2f32; S];
    engine.process_block(&mut buf);
    engine.finish_recording();
    engine.set_mode_from_loop_start(Mode::Playback);

    c.bench_function("engine process_block playback 64 samples", |b| {
        let mut buf = [0.0f32; 64];
        b.iter(|| {
            engine.process_block(black_box(&mut buf));
        })
    });
}

criterion_group!(benches, bench_process_block, bench_playback);
criterion_main!(benches);
