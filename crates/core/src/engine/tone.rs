use std::{
    f64::consts::TAU,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use futures::{future::BoxFuture, FutureExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rhai::{Array, Dynamic, EvalAltResult, ImmutableString};
use tracing::{debug, info};

use super::{
    dynamic_number, midi_to_hz, Exports, GlobalValue, Pattern, PatternRuntime, Session, SoundEvent,
    StepValue,
};
use crate::{
    audio::{AudioContext, NodeId},
    timeline::CycleClock,
    GardenLiveError, Result,
};

/// Instrument used by note patterns that never call `.s(...)`.
pub const DEFAULT_SOUND: &str = "triangle";

pub const KNOWN_SOUNDS: &[&str] = &["sine", "sawtooth", "square", "triangle", "bd", "sd", "hh"];

const MASTER_LEVEL: f64 = 0.3;
const ATTACK_SECONDS: f64 = 0.005;
const UNPITCHED_HZ: f64 = 220.0;

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Built-in pattern runtime: a handful of oscillators and synthesised drums
/// driven by cyclic patterns.
pub struct ToneEngine {
    context: Arc<AudioContext>,
    output: NodeId,
    synth: Arc<Mutex<SynthState>>,
    initialized: AtomicBool,
}

struct SynthState {
    clock: CycleClock,
    active: Vec<Pattern>,
    events: Vec<SoundEvent>,
    rng: StdRng,
}

impl ToneEngine {
    /// Creates the engine and wires its master output to the context's
    /// destination.
    pub fn new(context: Arc<AudioContext>) -> Result<Self> {
        let output = {
            let mut graph = context.graph()?;
            let output = graph.create_gain(1.0);
            let destination = graph.destination();
            graph.connect(output, destination)?;
            output
        };

        Ok(Self {
            context,
            output,
            synth: Arc::new(Mutex::new(SynthState {
                clock: CycleClock::default(),
                active: Vec::new(),
                events: Vec::new(),
                rng: StdRng::seed_from_u64(0x6172_6465_6e),
            })),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number of patterns currently scheduled.
    pub fn active_patterns(&self) -> Result<usize> {
        Ok(lock_synth(&self.synth)?.active.len())
    }

    pub fn cycles_per_second(&self) -> Result<f64> {
        Ok(lock_synth(&self.synth)?.clock.cps())
    }

    /// Synthesises the next `frames` samples without routing them anywhere.
    pub fn synthesize(&self, frames: usize) -> Result<Vec<f32>> {
        let sample_rate = f64::from(self.context.sample_rate());
        let mut guard = lock_synth(&self.synth)?;
        let synth = &mut *guard;
        let mut block = Vec::with_capacity(frames);

        let cps = synth.clock.cps();
        // Events only change at step boundaries, so they are collected once
        // per step rather than once per sample.
        let mut valid_until = f64::NEG_INFINITY;

        for offset in 0..frames {
            let cycle = synth.clock.cycle_at(offset, sample_rate);
            if offset == 0 || cycle >= valid_until {
                synth.events.clear();
                valid_until = f64::INFINITY;
                for pattern in &synth.active {
                    pattern.collect_active(cycle, &mut synth.events);
                    valid_until = valid_until.min(pattern.next_boundary(cycle));
                }
            }

            let mut mix = 0.0;
            for event in &synth.events {
                let step_phase = ((cycle - event.step_start) / event.step_cycles).clamp(0.0, 1.0);
                let elapsed = step_phase * event.step_cycles / cps;
                let noise = synth.rng.gen_range(-1.0..=1.0);
                mix += voice(&event.value, event.sound.as_deref(), elapsed, noise)
                    * envelope(elapsed, step_phase)
                    * event.gain;
            }
            block.push((mix * MASTER_LEVEL).clamp(-1.0, 1.0) as f32);
        }

        synth.clock.advance(frames, sample_rate);
        Ok(block)
    }
}

impl PatternRuntime for ToneEngine {
    fn init(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            if !self.initialized.swap(true, Ordering::AcqRel) {
                info!(
                    sample_rate = self.context.sample_rate(),
                    "tone engine initialised"
                );
            }
            Ok(())
        }
        .boxed()
    }

    fn audio_context(&self) -> Option<Arc<AudioContext>> {
        Some(self.context.clone())
    }

    fn output_node(&self) -> Option<NodeId> {
        Some(self.output)
    }

    fn global(&self, name: &str) -> Option<GlobalValue> {
        match name {
            "masterGain" => Some(GlobalValue::Node(self.output)),
            "cps" => lock_synth(&self.synth)
                .ok()
                .map(|synth| GlobalValue::Number(synth.clock.cps())),
            _ => None,
        }
    }

    fn hush(&self) -> Result<()> {
        let mut synth = lock_synth(&self.synth)?;
        debug!(patterns = synth.active.len(), "hush");
        synth.active.clear();
        Ok(())
    }

    fn exports(&self) -> Exports {
        tone_exports(self.synth.clone(), Schedule::Immediate)
    }

    fn session(&self) -> Box<dyn Session> {
        Box::new(ToneSession {
            synth: self.synth.clone(),
            staged: Arc::default(),
        })
    }

    fn render(&self, frames: usize) -> Result<()> {
        let block = self.synthesize(frames)?;
        self.context.graph()?.process(self.output, &block)
    }
}

impl fmt::Debug for ToneEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToneEngine")
            .field("sample_rate", &self.context.sample_rate())
            .field("output", &self.output)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Where `.play()` puts a pattern.
#[derive(Clone)]
enum Schedule {
    Immediate,
    /// Held by a [`ToneSession`] until it commits.
    Staged(Arc<Mutex<Vec<Pattern>>>),
}

/// One evaluation's view of the engine. Patterns it plays only start
/// sounding once the session commits.
struct ToneSession {
    synth: Arc<Mutex<SynthState>>,
    staged: Arc<Mutex<Vec<Pattern>>>,
}

impl Session for ToneSession {
    fn exports(&self) -> Exports {
        tone_exports(self.synth.clone(), Schedule::Staged(self.staged.clone()))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let staged = std::mem::take(&mut *lock_staged(&self.staged)?);
        debug!(patterns = staged.len(), "committing played patterns");
        lock_synth(&self.synth)?.active.extend(staged);
        Ok(())
    }
}

fn tone_exports(synth: Arc<Mutex<SynthState>>, schedule: Schedule) -> Exports {
    let play_synth = synth.clone();
    let play_schedule = schedule.clone();
    let hush_synth = synth.clone();
    let hush_schedule = schedule;
    let cps_synth = synth.clone();
    let cpm_synth = synth;

    Exports::new()
        .setup(|engine| {
            engine
                .register_type_with_name::<Pattern>("Pattern")
                .register_fn("to_string", |pattern: &mut Pattern| pattern.to_string())
                .register_fn("to_debug", |pattern: &mut Pattern| pattern.to_string());
        })
        .function("note", |engine| {
            engine.register_fn("note", note);
        })
        .function("n", |engine| {
            engine.register_fn("n", note);
        })
        .function("s", |engine| {
            engine
                .register_fn("s", sound)
                .register_fn("s", with_sound);
        })
        .function("sound", |engine| {
            engine
                .register_fn("sound", sound)
                .register_fn("sound", with_sound);
        })
        .function("stack", |engine| {
            engine
                .register_fn("stack", |a: Pattern, b: Pattern| Pattern::stack([a, b]))
                .register_fn("stack", |a: Pattern, b: Pattern, c: Pattern| {
                    Pattern::stack([a, b, c])
                })
                .register_fn("stack", |a: Pattern, b: Pattern, c: Pattern, d: Pattern| {
                    Pattern::stack([a, b, c, d])
                })
                .register_fn("stack", stack_array);
        })
        .function("gain", |engine| {
            engine.register_fn("gain", |pattern: Pattern, value: Dynamic| -> ScriptResult<Pattern> {
                pattern.with_gain(number_arg("gain", &value)?).map_err(script_error)
            });
        })
        .function("fast", |engine| {
            engine.register_fn("fast", |pattern: Pattern, value: Dynamic| -> ScriptResult<Pattern> {
                pattern.fast(number_arg("fast", &value)?).map_err(script_error)
            });
        })
        .function("slow", |engine| {
            engine.register_fn("slow", |pattern: Pattern, value: Dynamic| -> ScriptResult<Pattern> {
                pattern.slow(number_arg("slow", &value)?).map_err(script_error)
            });
        })
        .function("play", move |engine| {
            let synth = play_synth.clone();
            let schedule = play_schedule.clone();
            engine.register_fn("play", move |pattern: Pattern| -> ScriptResult<Pattern> {
                if pattern.is_silent() {
                    return Ok(pattern);
                }
                match &schedule {
                    Schedule::Immediate => lock_synth(&synth)
                        .map_err(script_error)?
                        .active
                        .push(pattern.clone()),
                    Schedule::Staged(staged) => lock_staged(staged)
                        .map_err(script_error)?
                        .push(pattern.clone()),
                }
                Ok(pattern)
            });
        })
        .function("hush", move |engine| {
            let synth = hush_synth.clone();
            let schedule = hush_schedule.clone();
            engine.register_fn("hush", move || -> ScriptResult<()> {
                lock_synth(&synth).map_err(script_error)?.active.clear();
                if let Schedule::Staged(staged) = &schedule {
                    lock_staged(staged).map_err(script_error)?.clear();
                }
                Ok(())
            });
        })
        .function("setcps", move |engine| {
            let synth = cps_synth.clone();
            engine.register_fn("setcps", move |value: Dynamic| -> ScriptResult<()> {
                let cps = number_arg("setcps", &value)?;
                lock_synth(&synth)
                    .and_then(|mut state| state.clock.set_cps(cps))
                    .map_err(script_error)
            });
        })
        .function("setcpm", move |engine| {
            let synth = cpm_synth.clone();
            engine.register_fn("setcpm", move |value: Dynamic| -> ScriptResult<()> {
                let cpm = number_arg("setcpm", &value)?;
                lock_synth(&synth)
                    .and_then(|mut state| state.clock.set_cps(cpm / 60.0))
                    .map_err(script_error)
            });
        })
        .value("silence", Dynamic::from(Pattern::silence()))
}

fn note(value: Dynamic) -> ScriptResult<Pattern> {
    if let Some(number) = dynamic_number(&value) {
        return Pattern::notes(&number.to_string()).map_err(script_error);
    }
    let source = string_arg("note", value)?;
    Pattern::notes(&source).map_err(script_error)
}

fn sound(source: ImmutableString) -> ScriptResult<Pattern> {
    let pattern = Pattern::sounds(&source).map_err(script_error)?;
    for layer in pattern.layers() {
        for step in layer.steps.iter().flatten() {
            if let StepValue::Sound(name) = step {
                ensure_known_sound(name)?;
            }
        }
    }
    Ok(pattern)
}

fn with_sound(pattern: Pattern, name: ImmutableString) -> ScriptResult<Pattern> {
    ensure_known_sound(&name)?;
    Ok(pattern.with_sound(&name))
}

fn stack_array(items: Array) -> ScriptResult<Pattern> {
    let mut patterns = Vec::with_capacity(items.len());
    for item in items {
        let type_name = item.type_name();
        let pattern = item
            .try_cast::<Pattern>()
            .ok_or_else(|| format!("stack expects patterns, got {type_name}"))?;
        patterns.push(pattern);
    }
    Ok(Pattern::stack(patterns))
}

fn ensure_known_sound(name: &str) -> ScriptResult<()> {
    if KNOWN_SOUNDS.contains(&name) {
        Ok(())
    } else {
        Err(format!("sound `{name}` not found").into())
    }
}

fn number_arg(function: &str, value: &Dynamic) -> ScriptResult<f64> {
    dynamic_number(value)
        .ok_or_else(|| format!("{function} expects a number, got {}", value.type_name()).into())
}

fn string_arg(function: &str, value: Dynamic) -> ScriptResult<String> {
    let type_name = value.type_name();
    value
        .into_string()
        .map_err(|_| format!("{function} expects a string or number, got {type_name}").into())
}

fn script_error(err: GardenLiveError) -> Box<EvalAltResult> {
    err.to_string().into()
}

fn lock_synth(synth: &Mutex<SynthState>) -> Result<MutexGuard<'_, SynthState>> {
    synth
        .lock()
        .map_err(|_| GardenLiveError::msg("tone engine state has been poisoned"))
}

fn lock_staged(staged: &Mutex<Vec<Pattern>>) -> Result<MutexGuard<'_, Vec<Pattern>>> {
    staged
        .lock()
        .map_err(|_| GardenLiveError::msg("played patterns have been poisoned"))
}

fn voice(value: &StepValue, instrument: Option<&str>, elapsed: f64, noise: f64) -> f64 {
    match value {
        StepValue::Note(midi) => {
            let instrument = instrument.unwrap_or(DEFAULT_SOUND);
            drum(instrument, elapsed, noise)
                .unwrap_or_else(|| oscillator(instrument, midi_to_hz(*midi), elapsed))
        }
        StepValue::Sound(name) => drum(name, elapsed, noise)
            .unwrap_or_else(|| oscillator(name, UNPITCHED_HZ, elapsed)),
    }
}

/// Unpitched drum voices; `None` for anything that is not a drum.
fn drum(name: &str, elapsed: f64, noise: f64) -> Option<f64> {
    let sample = match name {
        "bd" => {
            let sweep = 50.0 + 100.0 * (-elapsed * 30.0).exp();
            (TAU * sweep * elapsed).sin() * (-elapsed * 8.0).exp()
        }
        "sd" => {
            let body = (TAU * 180.0 * elapsed).sin() * (-elapsed * 15.0).exp();
            0.7 * noise * (-elapsed * 20.0).exp() + 0.3 * body
        }
        "hh" => 0.5 * noise * (-elapsed * 40.0).exp(),
        _ => return None,
    };
    Some(sample)
}

fn oscillator(waveform: &str, hz: f64, elapsed: f64) -> f64 {
    let phase = (hz * elapsed).fract();
    match waveform {
        "sine" => (TAU * phase).sin(),
        "sawtooth" => 2.0 * phase - 1.0,
        "square" => {
            if phase < 0.5 {
                1.0
            } else {
                -1.0
            }
        }
        _ => 1.0 - 4.0 * (phase - 0.5).abs(),
    }
}

// Linear attack, then a linear fall to zero at the end of the step.
fn envelope(elapsed: f64, step_phase: f64) -> f64 {
    (elapsed / ATTACK_SECONDS).min(1.0) * (1.0 - step_phase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ToneEngine {
        ToneEngine::new(AudioContext::new(8_000)).unwrap()
    }

    fn script_engine(tone: &ToneEngine) -> rhai::Engine {
        let mut engine = rhai::Engine::new_raw();
        tone.exports().install(&mut engine);
        engine
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let tone = engine();
        tone.init().await.unwrap();
        tone.init().await.unwrap();
        assert!(tone.is_initialized());
    }

    #[test]
    fn exports_cover_the_pattern_vocabulary() {
        let names = engine().exports().names().join(",");
        for name in ["note", "s", "stack", "gain", "play", "hush", "setcps", "silence"] {
            assert!(names.split(',').any(|n| n == name), "missing {name}");
        }
    }

    #[test]
    fn play_schedules_and_hush_clears() {
        let tone = engine();
        let engine = script_engine(&tone);

        engine
            .run(r#"stack(note("c3 e3"), s("bd ~ sd")).gain(0.8).play();"#)
            .unwrap();
        assert_eq!(tone.active_patterns().unwrap(), 1);

        tone.hush().unwrap();
        assert_eq!(tone.active_patterns().unwrap(), 0);
    }

    #[test]
    fn unknown_sounds_raise_script_errors() {
        let tone = engine();
        let engine = script_engine(&tone);

        let err = engine.run(r#"s("kazoo").play();"#).unwrap_err();
        assert!(err.to_string().contains("kazoo"));
        assert_eq!(tone.active_patterns().unwrap(), 0);
    }

    #[test]
    fn setcpm_changes_tempo() {
        let tone = engine();
        let engine = script_engine(&tone);
        engine.run("setcpm(90);").unwrap();
        assert!((tone.cycles_per_second().unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn render_reaches_destination() {
        let tone = engine();
        let engine = script_engine(&tone);
        engine.run(r#"note("a3").s("sine").play();"#).unwrap();

        tone.context.graph().unwrap().enable_capture();
        tone.render(800).unwrap();

        let captured = tone.context.graph().unwrap().take_capture();
        assert_eq!(captured.len(), 800);
        assert!(captured.iter().any(|s| s.abs() > 0.01));
        assert!(captured.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn session_holds_played_patterns_until_commit() {
        let tone = engine();

        let session = tone.session();
        let mut engine = rhai::Engine::new_raw();
        session.exports().install(&mut engine);
        engine.run(r#"note("c3").play(); s("bd").play();"#).unwrap();
        assert_eq!(tone.active_patterns().unwrap(), 0);

        session.commit().unwrap();
        assert_eq!(tone.active_patterns().unwrap(), 2);
    }

    #[test]
    fn dropped_session_schedules_nothing() {
        let tone = engine();

        let session = tone.session();
        let mut engine = rhai::Engine::new_raw();
        session.exports().install(&mut engine);
        engine.run(r#"note("c3").play();"#).unwrap();
        drop(session);

        assert_eq!(tone.active_patterns().unwrap(), 0);
    }

    #[test]
    fn hush_inside_a_session_discards_earlier_plays() {
        let tone = engine();

        let session = tone.session();
        let mut engine = rhai::Engine::new_raw();
        session.exports().install(&mut engine);
        engine
            .run(r#"note("c3").play(); hush(); s("hh").play();"#)
            .unwrap();
        session.commit().unwrap();

        assert_eq!(tone.active_patterns().unwrap(), 1);
    }

    #[test]
    fn drum_instruments_apply_to_note_steps() {
        for t in [0.0, 0.01, 0.05] {
            assert_eq!(
                voice(&StepValue::Note(48.0), Some("bd"), t, 0.3),
                voice(&StepValue::Sound("bd".into()), None, t, 0.3)
            );
        }
        assert_eq!(
            voice(&StepValue::Note(69.0), Some("sine"), 0.25 / 440.0, 0.0),
            oscillator("sine", 440.0, 0.25 / 440.0)
        );
    }

    #[test]
    fn rendering_across_step_boundaries_changes_voices() {
        let tone = engine();
        let engine = script_engine(&tone);
        engine.run(r#"note("a3 ~").s("sine").fast(4).play();"#).unwrap();

        // 8 steps per cycle at 0.5 cps and 8 kHz: 2_000 samples per step.
        let block = tone.synthesize(4_000).unwrap();
        assert!(block[..2_000].iter().any(|s| s.abs() > 0.01));
        assert!(block[2_010..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn silence_renders_zeros() {
        let tone = engine();
        let block = tone.synthesize(256).unwrap();
        assert!(block.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn exposes_output_through_globals() {
        let tone = engine();
        assert_eq!(tone.global("masterGain"), tone.output_node().map(GlobalValue::Node));
        assert_eq!(tone.global("unknown"), None);
    }
}
