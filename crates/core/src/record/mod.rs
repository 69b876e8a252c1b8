use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{audio::AudioContext, GardenLiveError, Result};

/// Where and how captured audio is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSettings {
    pub output_path: PathBuf,
}

impl RecordingSettings {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

/// Captures everything that reaches an audio context's destination and
/// writes it out as a mono 32-bit float WAV file.
#[derive(Debug)]
pub struct Recorder {
    settings: RecordingSettings,
    is_recording: bool,
}

impl Recorder {
    pub fn new(settings: RecordingSettings) -> Self {
        Self {
            settings,
            is_recording: false,
        }
    }

    pub fn start(&mut self, context: &AudioContext) -> Result<()> {
        if self.is_recording {
            return Err(GardenLiveError::InvalidInput("recorder already started"));
        }
        context.graph()?.enable_capture();
        self.is_recording = true;
        Ok(())
    }

    /// Stops capturing and writes the file. Returns the number of frames
    /// written.
    pub fn stop(&mut self, context: &AudioContext) -> Result<usize> {
        if !self.is_recording {
            return Err(GardenLiveError::InvalidInput("recorder was not started"));
        }
        self.is_recording = false;

        let samples = context.graph()?.take_capture();
        write_wav(&self.settings.output_path, context.sample_rate(), &samples)?;
        info!(
            path = %self.settings.output_path.display(),
            frames = samples.len(),
            "recording written"
        );
        Ok(samples.len())
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }
}

pub fn write_wav(path: impl AsRef<Path>, sample_rate: u32, samples: &[f32]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use hound::WavReader;

    use super::*;

    #[test]
    fn records_what_reaches_the_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let context = AudioContext::new(8_000);
        let mut recorder = Recorder::new(RecordingSettings::new(&path));

        recorder.start(&context).unwrap();
        assert!(recorder.is_recording());
        {
            let mut graph = context.graph().unwrap();
            let destination = graph.destination();
            graph.process(destination, &[0.25, -0.5, 1.0]).unwrap();
        }
        let frames = recorder.stop(&context).unwrap();
        assert_eq!(frames, 3);

        let reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8_000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<f32> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let context = AudioContext::new(8_000);
        let mut recorder = Recorder::new(RecordingSettings::new(dir.path().join("x.wav")));
        assert!(recorder.stop(&context).is_err());
        assert!(recorder.start(&context).is_ok());
        assert!(recorder.start(&context).is_err());
    }
}
