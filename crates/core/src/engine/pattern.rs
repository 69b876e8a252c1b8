use std::fmt;

use crate::{GardenLiveError, Result};

const DEFAULT_OCTAVE: i32 = 3;

/// One step of a layer.
#[derive(Debug, Clone, PartialEq)]
pub enum StepValue {
    /// MIDI note number; fractional values detune.
    Note(f64),
    Sound(String),
}

/// A cyclic sequence: `steps` divide one cycle evenly.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub steps: Vec<Option<StepValue>>,
    /// Instrument for note steps.
    pub sound: Option<String>,
    pub gain: f64,
    /// Cycles per cycle, `fast(2)` doubles it.
    pub speed: f64,
}

/// A stack of layers that play simultaneously.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pattern {
    layers: Vec<Layer>,
}

/// A step sounding at a given cycle position.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundEvent {
    pub value: StepValue,
    pub sound: Option<String>,
    pub gain: f64,
    /// Position within the step, in `[0, 1)`.
    pub step_phase: f64,
    /// Cycle at which the step began.
    pub step_start: f64,
    /// Length of the step in cycles.
    pub step_cycles: f64,
}

impl Pattern {
    pub fn silence() -> Self {
        Self::default()
    }

    /// Parses space-separated note steps: names like `c3`, `eb4`, `f#2`,
    /// MIDI numbers, or `~` for a rest.
    pub fn notes(source: &str) -> Result<Self> {
        let steps = parse_steps(source, |token| parse_note(token).map(StepValue::Note))?;
        Ok(Self::from_steps(steps))
    }

    /// Parses space-separated sound names, `~` for a rest.
    pub fn sounds(source: &str) -> Result<Self> {
        let steps = parse_steps(source, |token| {
            let valid = token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
            if valid {
                Ok(StepValue::Sound(token.to_string()))
            } else {
                Err(GardenLiveError::Runtime(format!("invalid sound name `{token}`")))
            }
        })?;
        Ok(Self::from_steps(steps))
    }

    pub fn stack(patterns: impl IntoIterator<Item = Pattern>) -> Self {
        Self {
            layers: patterns.into_iter().flat_map(|p| p.layers).collect(),
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn is_silent(&self) -> bool {
        self.layers
            .iter()
            .all(|layer| layer.steps.iter().all(Option::is_none))
    }

    pub fn with_gain(mut self, gain: f64) -> Result<Self> {
        if !gain.is_finite() || gain < 0.0 {
            return Err(GardenLiveError::Runtime(format!(
                "gain must be a non-negative number, got {gain}"
            )));
        }
        for layer in &mut self.layers {
            layer.gain *= gain;
        }
        Ok(self)
    }

    pub fn fast(mut self, factor: f64) -> Result<Self> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(GardenLiveError::Runtime(format!(
                "speed factor must be positive, got {factor}"
            )));
        }
        for layer in &mut self.layers {
            layer.speed *= factor;
        }
        Ok(self)
    }

    pub fn slow(self, factor: f64) -> Result<Self> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(GardenLiveError::Runtime(format!(
                "speed factor must be positive, got {factor}"
            )));
        }
        self.fast(1.0 / factor)
    }

    /// Sets the instrument used by note steps.
    pub fn with_sound(mut self, sound: &str) -> Self {
        for layer in &mut self.layers {
            layer.sound = Some(sound.to_string());
        }
        self
    }

    /// Steps sounding at `cycle`, one per non-resting layer.
    pub fn active_at(&self, cycle: f64) -> Vec<SoundEvent> {
        let mut events = Vec::new();
        self.collect_active(cycle, &mut events);
        events
    }

    /// Appends the steps sounding at `cycle` to `events`.
    pub fn collect_active(&self, cycle: f64, events: &mut Vec<SoundEvent>) {
        for layer in &self.layers {
            let count = layer.steps.len();
            if count == 0 {
                continue;
            }
            let rate = layer.speed * count as f64;
            let position = cycle * rate;
            let index = position.floor().rem_euclid(count as f64) as usize;
            if let Some(value) = &layer.steps[index] {
                events.push(SoundEvent {
                    value: value.clone(),
                    sound: layer.sound.clone(),
                    gain: layer.gain,
                    step_phase: position - position.floor(),
                    step_start: position.floor() / rate,
                    step_cycles: 1.0 / rate,
                });
            }
        }
    }

    /// Earliest cycle after `cycle` at which any layer moves to its next
    /// step, rests included. Infinite for silence.
    pub fn next_boundary(&self, cycle: f64) -> f64 {
        self.layers
            .iter()
            .filter(|layer| !layer.steps.is_empty())
            .map(|layer| {
                let rate = layer.speed * layer.steps.len() as f64;
                ((cycle * rate).floor() + 1.0) / rate
            })
            .fold(f64::INFINITY, f64::min)
    }

    fn from_steps(steps: Vec<Option<StepValue>>) -> Self {
        if steps.is_empty() {
            return Self::silence();
        }
        Self {
            layers: vec![Layer {
                steps,
                sound: None,
                gain: 1.0,
                speed: 1.0,
            }],
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.layers.is_empty() {
            return write!(f, "silence");
        }
        let layers: Vec<String> = self
            .layers
            .iter()
            .map(|layer| {
                let steps: Vec<String> = layer
                    .steps
                    .iter()
                    .map(|step| match step {
                        None => "~".to_string(),
                        Some(StepValue::Note(midi)) => format!("{midi}"),
                        Some(StepValue::Sound(name)) => name.clone(),
                    })
                    .collect();
                format!("\"{}\"", steps.join(" "))
            })
            .collect();
        write!(f, "stack({})", layers.join(", "))
    }
}

fn parse_steps(
    source: &str,
    mut parse: impl FnMut(&str) -> Result<StepValue>,
) -> Result<Vec<Option<StepValue>>> {
    source
        .split_whitespace()
        .map(|token| match token {
            "~" => Ok(None),
            other => parse(other).map(Some),
        })
        .collect()
}

/// Converts a note name or number to a MIDI note number. `c4` is 60.
pub fn parse_note(token: &str) -> Result<f64> {
    let invalid = || GardenLiveError::Runtime(format!("unknown note `{token}`"));
    if let Ok(number) = token.parse::<f64>() {
        return if number.is_finite() { Ok(number) } else { Err(invalid()) };
    }

    let mut chars = token.chars();
    let letter = chars.next().ok_or_else(invalid)?;
    let pitch_class = match letter.to_ascii_lowercase() {
        'c' => 0,
        'd' => 2,
        'e' => 4,
        'f' => 5,
        'g' => 7,
        'a' => 9,
        'b' => 11,
        _ => return Err(invalid()),
    };

    let rest = chars.as_str();
    let octave_start = rest
        .find(|c: char| c.is_ascii_digit() || c == '-')
        .unwrap_or(rest.len());
    let (accidentals, octave) = rest.split_at(octave_start);

    let mut offset = 0;
    for accidental in accidentals.chars() {
        offset += match accidental {
            '#' | 's' => 1,
            'b' => -1,
            _ => return Err(invalid()),
        };
    }

    let octave = if octave.is_empty() {
        DEFAULT_OCTAVE
    } else {
        octave.parse::<i32>().map_err(|_| invalid())?
    };

    Ok(f64::from((octave + 1) * 12 + pitch_class + offset))
}

pub fn midi_to_hz(midi: f64) -> f64 {
    440.0 * 2f64.powf((midi - 69.0) / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_note_names() {
        assert_eq!(parse_note("c4").unwrap(), 60.0);
        assert_eq!(parse_note("a4").unwrap(), 69.0);
        assert_eq!(parse_note("c").unwrap(), 48.0);
        assert_eq!(parse_note("eb3").unwrap(), 51.0);
        assert_eq!(parse_note("f#2").unwrap(), 42.0);
        assert_eq!(parse_note("64").unwrap(), 64.0);
        assert!(parse_note("h2").is_err());
        assert!(parse_note("cx3").is_err());
        assert!(parse_note("nan").is_err());
    }

    #[test]
    fn converts_midi_to_frequency() {
        assert!((midi_to_hz(69.0) - 440.0).abs() < 1e-9);
        assert!((midi_to_hz(57.0) - 220.0).abs() < 1e-9);
    }

    #[test]
    fn finds_active_step_per_cycle_position() {
        let pattern = Pattern::notes("c3 ~ e3 g3").unwrap();

        let first = pattern.active_at(0.1);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].value, StepValue::Note(48.0));
        assert!((first[0].step_phase - 0.4).abs() < 1e-9);
        assert!((first[0].step_cycles - 0.25).abs() < 1e-9);

        assert!(pattern.active_at(0.3).is_empty());
        assert_eq!(pattern.active_at(1.8)[0].value, StepValue::Note(55.0));
    }

    #[test]
    fn boundaries_include_rests_and_fast_layers() {
        let pattern = Pattern::stack([
            Pattern::notes("c3 ~").unwrap(),
            Pattern::sounds("bd").unwrap().fast(3.0).unwrap(),
        ]);
        assert!((pattern.next_boundary(0.1) - 1.0 / 3.0).abs() < 1e-12);
        assert!((pattern.next_boundary(0.4) - 0.5).abs() < 1e-12);
        assert_eq!(Pattern::silence().next_boundary(0.2), f64::INFINITY);

        let events = pattern.active_at(0.4);
        assert!((events[0].step_start - 0.0).abs() < 1e-12);
        assert!((events[1].step_start - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn fast_compresses_the_cycle() {
        let pattern = Pattern::sounds("bd sd").unwrap().fast(2.0).unwrap();
        assert_eq!(
            pattern.active_at(0.3)[0].value,
            StepValue::Sound("sd".into())
        );
    }

    #[test]
    fn stack_layers_sound_together() {
        let pattern = Pattern::stack([
            Pattern::sounds("bd").unwrap(),
            Pattern::notes("c3").unwrap().with_gain(0.5).unwrap(),
        ]);
        let events = pattern.active_at(0.0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].gain, 0.5);
    }

    #[test]
    fn rejects_invalid_modifiers() {
        let pattern = Pattern::notes("c3").unwrap();
        assert!(pattern.clone().fast(0.0).is_err());
        assert!(pattern.clone().slow(-1.0).is_err());
        assert!(pattern.with_gain(f64::NAN).is_err());
    }

    #[test]
    fn empty_source_is_silence() {
        assert!(Pattern::notes("  ").unwrap().is_silent());
        assert!(Pattern::sounds("~ ~").unwrap().is_silent());
        assert_eq!(Pattern::silence().to_string(), "silence");
    }
}
