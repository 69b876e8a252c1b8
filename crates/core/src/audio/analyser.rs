use std::{
    f32::consts::PI,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{GardenLiveError, Result};

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const BLACKMAN_ALPHA: f32 = 0.16;

/// Signal tap that records the most recent `fft_size` samples flowing through
/// it and reports a byte-quantised magnitude spectrum on demand.
///
/// The node is shared between the runtime that splices it into the audio
/// graph and every visualizer reading from it.
pub struct AnalyserNode {
    fft_size: usize,
    smoothing: f32,
    state: Mutex<AnalyserState>,
}

struct AnalyserState {
    ring: Vec<f32>,
    write: usize,
    smoothed: Vec<f32>,
    fft: FftResources,
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
    window: Vec<f32>,
}

impl AnalyserNode {
    pub fn new(fft_size: usize, smoothing: f32) -> Result<Self> {
        if !fft_size.is_power_of_two() || fft_size < 32 {
            return Err(GardenLiveError::InvalidInput(
                "analyser fft size must be a power of two of at least 32",
            ));
        }
        if !(0.0..=1.0).contains(&smoothing) {
            return Err(GardenLiveError::InvalidInput(
                "analyser smoothing must be within [0, 1]",
            ));
        }

        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let fft = FftResources {
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            window: (0..fft_size).map(|i| blackman_value(i, fft_size)).collect(),
            plan,
        };

        Ok(Self {
            fft_size,
            smoothing,
            state: Mutex::new(AnalyserState {
                ring: vec![0.0; fft_size],
                write: 0,
                smoothed: vec![0.0; fft_size / 2],
                fft,
            }),
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    /// Number of bins reported by [`AnalyserNode::byte_frequency_data`].
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Records samples passing through the node.
    pub fn push_samples(&self, samples: &[f32]) -> Result<()> {
        let mut state = self.lock()?;
        let len = state.ring.len();
        // Only the tail of an oversized block can survive in the window.
        let tail = &samples[samples.len().saturating_sub(len)..];
        for sample in tail {
            let write = state.write;
            state.ring[write] = *sample;
            state.write = (write + 1) % len;
        }
        Ok(())
    }

    /// Fills `out` with the current spectrum, one byte per bin. Extra bytes in
    /// `out` beyond [`AnalyserNode::frequency_bin_count`] are left untouched.
    pub fn byte_frequency_data(&self, out: &mut [u8]) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let len = self.fft_size;

        for i in 0..len {
            let sample = state.ring[(state.write + i) % len];
            state.fft.input[i] = sample * state.fft.window[i];
        }

        let fft = &mut state.fft;
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let scale = 255.0 / (MAX_DECIBELS - MIN_DECIBELS);
        for (bin, smoothed) in state.smoothed.iter_mut().enumerate() {
            let magnitude = fft.spectrum[bin].norm() / len as f32;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;

            if let Some(byte) = out.get_mut(bin) {
                *byte = if *smoothed <= f32::EPSILON {
                    0
                } else {
                    let db = 20.0 * smoothed.log10();
                    ((db - MIN_DECIBELS) * scale).clamp(0.0, 255.0) as u8
                };
            }
        }

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, AnalyserState>> {
        self.state
            .lock()
            .map_err(|_| GardenLiveError::msg("analyser state has been poisoned"))
    }
}

impl fmt::Debug for AnalyserNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyserNode")
            .field("fft_size", &self.fft_size)
            .field("smoothing", &self.smoothing)
            .finish()
    }
}

fn blackman_value(index: usize, len: usize) -> f32 {
    let a0 = (1.0 - BLACKMAN_ALPHA) / 2.0;
    let a1 = 0.5;
    let a2 = BLACKMAN_ALPHA / 2.0;
    let phase = 2.0 * PI * index as f32 / len as f32;
    a0 - a1 * phase.cos() + a2 * (2.0 * phase).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin_sine(fft_size: usize, bin: usize) -> Vec<f32> {
        (0..fft_size)
            .map(|n| (2.0 * PI * bin as f32 * n as f32 / fft_size as f32).sin())
            .collect()
    }

    #[test]
    fn silence_reports_empty_spectrum() {
        let analyser = AnalyserNode::new(256, 0.0).unwrap();
        analyser.push_samples(&[0.0; 256]).unwrap();

        let mut bytes = vec![7u8; analyser.frequency_bin_count()];
        analyser.byte_frequency_data(&mut bytes).unwrap();
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn sine_peaks_in_its_bin() {
        let analyser = AnalyserNode::new(256, 0.0).unwrap();
        analyser.push_samples(&bin_sine(256, 16)).unwrap();

        let mut bytes = vec![0u8; 128];
        analyser.byte_frequency_data(&mut bytes).unwrap();
        assert_eq!(bytes[16], 255);
        assert!(bytes[16] > bytes[100]);
    }

    #[test]
    fn smoothing_holds_energy_after_silence() {
        let analyser = AnalyserNode::new(256, 0.8).unwrap();
        let mut bytes = vec![0u8; 128];

        analyser.push_samples(&bin_sine(256, 8)).unwrap();
        analyser.byte_frequency_data(&mut bytes).unwrap();
        analyser.push_samples(&[0.0; 256]).unwrap();
        analyser.byte_frequency_data(&mut bytes).unwrap();

        assert!(bytes[8] > 0);
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(AnalyserNode::new(100, 0.5).is_err());
        assert!(AnalyserNode::new(256, 1.5).is_err());
    }
}
