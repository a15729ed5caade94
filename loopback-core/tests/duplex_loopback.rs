use std::thread;
use std::time::Duration;

use approx::assert_relative_eq;
use loopback_core::{
    audio::{SineSource, SyntheticBackend},
    DuplexConfig, DuplexEngine, EngineConfig, EngineState,
};

const SAMPLE_RATE: u32 = 48_000;
const BLOCK: u32 = 128;

fn sine() -> SineSource {
    SineSource::new(1_000.0, SAMPLE_RATE, 0.8)
}

#[test]
fn sine_survives_the_loop_with_no_steady_state_loss() {
    // 128 frames every ~2.67 ms. Playback starts ~64 ms late so the ring
    // absorbs scheduler jitter between the two workers.
    let backend = SyntheticBackend::new(sine()).with_playback_delay(Duration::from_millis(64));
    let tap = backend.tap();
    let mut engine = DuplexEngine::new(backend, EngineConfig::default());

    let config = DuplexConfig {
        sample_rate: SAMPLE_RATE,
        block_size_hint: BLOCK,
        ..Default::default()
    };
    engine.start(&config).unwrap();

    thread::sleep(Duration::from_millis(250));
    engine.supervise().unwrap();
    let warm = engine.diagnostics_snapshot();

    thread::sleep(Duration::from_millis(1_750));
    engine.supervise().unwrap();
    engine.stop();
    let end = engine.diagnostics_snapshot();

    let steady = end.since(&warm);
    assert_eq!(steady.overrun_events, 0, "{steady:?}");
    assert_eq!(steady.underrun_events, 0, "{steady:?}");
    assert_eq!(end.overrun_events, 0);
    assert_eq!(end.fatal_faults, 0);
    assert!(
        end.frames_played >= u64::from(SAMPLE_RATE),
        "only {} frames played",
        end.frames_played
    );

    let played = tap.take();
    assert_eq!(
        played.len() as u64,
        end.frames_played + end.underrun_frames
    );

    // Every frame played after warm-up is real audio, so the tail of the
    // tap is the sine at exactly those frame indices.
    let reference = sine();
    let tail = steady.frames_played as usize;
    let first = end.frames_played - steady.frames_played;
    for (offset, &sample) in played[played.len() - tail..].iter().enumerate() {
        assert_relative_eq!(
            sample,
            reference.sample_at(first + offset as u64),
            epsilon = 1e-6
        );
    }
}

#[test]
fn lifecycle_is_repeatable_and_stop_is_idempotent() {
    let backend = SyntheticBackend::new(sine()).discard_playback();
    let control = backend.control();
    let mut engine = DuplexEngine::new(backend, EngineConfig::default());

    for _ in 0..3 {
        engine.start(&DuplexConfig::default()).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        thread::sleep(Duration::from_millis(20));
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(control.live_streams(), 0);
    }
}

#[test]
fn independent_engines_run_side_by_side() {
    let a = SyntheticBackend::new(sine()).discard_playback();
    let b = SyntheticBackend::new(sine()).discard_playback();
    let mut first = DuplexEngine::new(a, EngineConfig::default());
    let mut second = DuplexEngine::new(b, EngineConfig::default());

    first.start(&DuplexConfig::default()).unwrap();
    second.start(&DuplexConfig::default()).unwrap();
    thread::sleep(Duration::from_millis(30));
    first.stop();
    assert!(second.is_running());
    assert!(second.diagnostics_snapshot().frames_captured > 0);
    second.stop();
}
