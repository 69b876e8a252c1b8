//! Per-element bar animation driven by the shared analyser, or by a
//! synthetic signal when no analyser is attached.

use std::{
    f64::consts::TAU,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{audio::AnalyserNode, config::VisualizerConfig, GardenLiveError, Result};

/// The demo clock wraps after this many seconds. Every demo frequency is a
/// whole number of radians per second, so the synthetic signal repeats
/// exactly once per period.
pub const DEMO_PERIOD: f64 = TAU;

const BASE_LEVEL: f64 = 0.35;
const BASE_DEPTH: f64 = 0.25;
const BASE_SPEED: f64 = 2.0;
const BASE_SHIFT: f64 = 0.45;
const RIPPLE_DEPTH: f64 = 0.12;
const RIPPLE_SPEED: f64 = 7.0;
const RIPPLE_SHIFT: f64 = 1.3;
const ACCENT_DEPTH: f64 = 0.2;
const ACCENT_SPEED: f64 = 4.0;
const ACCENT_EVERY: usize = 4;

/// Snapshot handed to whatever draws the bars.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BarFrame {
    pub amplitudes: Vec<f32>,
    pub peaks: Vec<f32>,
    pub playing: bool,
}

#[derive(Debug)]
pub struct Visualizer {
    amplitudes: Vec<f32>,
    peaks: Vec<f32>,
    peak_decay_rate: f32,
    playing: bool,
    analyser: Option<Weak<AnalyserNode>>,
    bins: Vec<u8>,
    demo_time: f64,
}

impl Visualizer {
    pub fn new(config: &VisualizerConfig) -> Result<Self> {
        if config.bar_count == 0 {
            return Err(GardenLiveError::InvalidInput(
                "visualizer needs at least one bar",
            ));
        }

        Ok(Self {
            amplitudes: vec![0.0; config.bar_count],
            peaks: vec![0.0; config.bar_count],
            peak_decay_rate: config.peak_decay_rate,
            playing: false,
            analyser: None,
            bins: Vec::new(),
            demo_time: 0.0,
        })
    }

    pub fn bar_count(&self) -> usize {
        self.amplitudes.len()
    }

    /// Reads from `analyser` on later frames. Only a weak reference is kept.
    pub fn attach(&mut self, analyser: &Arc<AnalyserNode>) {
        self.analyser = Some(Arc::downgrade(analyser));
    }

    pub fn detach(&mut self) {
        self.analyser = None;
    }

    pub fn is_demo(&self) -> bool {
        self.live_analyser().is_none()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn start(&mut self) {
        self.playing = true;
    }

    /// Stops updating and zeroes every bar and peak at once.
    pub fn stop(&mut self) {
        self.playing = false;
        self.amplitudes.fill(0.0);
        self.peaks.fill(0.0);
    }

    /// Advances one animation frame, `dt` seconds after the previous one.
    pub fn tick(&mut self, dt: f64) -> Result<()> {
        if !self.playing {
            return Ok(());
        }

        match self.live_analyser() {
            Some(analyser) => {
                self.bins.resize(analyser.frequency_bin_count(), 0);
                analyser.byte_frequency_data(&mut self.bins)?;
                bars_from_bins(&self.bins, &mut self.amplitudes);
            }
            None => {
                if self.analyser.take().is_some() {
                    debug!("analyser dropped, switching to demo signal");
                }
                self.demo_time = (self.demo_time + dt).rem_euclid(DEMO_PERIOD);
                for (index, amplitude) in self.amplitudes.iter_mut().enumerate() {
                    *amplitude = demo_amplitude(index, self.demo_time);
                }
            }
        }

        for (peak, &amplitude) in self.peaks.iter_mut().zip(&self.amplitudes) {
            *peak = next_peak(*peak, amplitude, self.peak_decay_rate);
        }
        Ok(())
    }

    pub fn frame(&self) -> BarFrame {
        BarFrame {
            amplitudes: self.amplitudes.clone(),
            peaks: self.peaks.clone(),
            playing: self.playing,
        }
    }

    fn live_analyser(&self) -> Option<Arc<AnalyserNode>> {
        self.analyser.as_ref().and_then(Weak::upgrade)
    }
}

/// Averages `bins` into `bars`, normalised to `[0, 1]`.
///
/// Each bar covers `bins.len() / bars.len()` consecutive bins; leftover bins
/// at the top of the spectrum are ignored. With fewer bins than bars, the
/// first bars take one bin each and the rest stay at zero.
pub fn bars_from_bins(bins: &[u8], bars: &mut [f32]) {
    if bars.is_empty() {
        return;
    }

    let width = bins.len() / bars.len();
    if width == 0 {
        for (index, bar) in bars.iter_mut().enumerate() {
            *bar = bins.get(index).map_or(0.0, |&bin| f32::from(bin) / 255.0);
        }
        return;
    }

    for (bar, group) in bars.iter_mut().zip(bins.chunks_exact(width)) {
        let sum: u32 = group.iter().map(|&bin| u32::from(bin)).sum();
        *bar = sum as f32 / (width as f32 * 255.0);
    }
}

/// Synthetic level for bar `index` at demo time `t`: a slow wave travelling
/// across the bars, a faster ripple and a pulse on every fourth bar.
pub fn demo_amplitude(index: usize, t: f64) -> f32 {
    let i = index as f64;
    let base = BASE_LEVEL + BASE_DEPTH * (BASE_SPEED * t - BASE_SHIFT * i).sin();
    let ripple = RIPPLE_DEPTH * (RIPPLE_SPEED * t + RIPPLE_SHIFT * i).sin();
    let accent = if index % ACCENT_EVERY == 0 {
        ACCENT_DEPTH * (ACCENT_SPEED * t).sin().max(0.0)
    } else {
        0.0
    };
    (base + ripple + accent).clamp(0.0, 1.0) as f32
}

/// Peaks jump to a louder amplitude immediately and otherwise fall linearly.
pub fn next_peak(peak: f32, amplitude: f32, decay_rate: f32) -> f32 {
    if amplitude >= peak {
        amplitude
    } else {
        (peak - decay_rate).max(0.0)
    }
}

/// Background task ticking a [`Visualizer`] at a fixed frame rate.
///
/// Frames are published on a `watch` channel. The task publishes one final
/// frame once the visualizer is stopped and then ends. Dropping the loop
/// aborts the task.
pub struct FrameLoop {
    frames: watch::Receiver<BarFrame>,
    task: JoinHandle<()>,
}

impl FrameLoop {
    pub fn spawn(visualizer: Arc<Mutex<Visualizer>>, frame_rate: u32) -> Result<Self> {
        if frame_rate == 0 {
            return Err(GardenLiveError::InvalidInput("frame rate must be positive"));
        }

        let initial = lock(&visualizer)?.frame();
        let (sender, frames) = watch::channel(initial);
        let period = Duration::from_secs_f64(1.0 / f64::from(frame_rate));

        let task = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last = Instant::now();

            loop {
                interval.tick().await;
                let now = Instant::now();
                let dt = now.duration_since(last).as_secs_f64();
                last = now;

                let frame = match advance(&visualizer, dt) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "visualizer frame failed");
                        break;
                    }
                };

                let playing = frame.playing;
                if sender.send(frame).is_err() || !playing {
                    break;
                }
            }
            debug!("frame loop finished");
        });

        Ok(Self { frames, task })
    }

    pub fn frames(&self) -> watch::Receiver<BarFrame> {
        self.frames.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn advance(visualizer: &Mutex<Visualizer>, dt: f64) -> Result<BarFrame> {
    let mut visualizer = lock(visualizer)?;
    if let Err(err) = visualizer.tick(dt) {
        warn!(error = %err, "analyser read failed, switching to demo signal");
        visualizer.detach();
        visualizer.tick(dt)?;
    }
    Ok(visualizer.frame())
}

fn lock(visualizer: &Mutex<Visualizer>) -> Result<std::sync::MutexGuard<'_, Visualizer>> {
    visualizer
        .lock()
        .map_err(|_| GardenLiveError::msg("visualizer state has been poisoned"))
}
