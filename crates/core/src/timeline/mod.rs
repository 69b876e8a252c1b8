use crate::{GardenLiveError, Result};

/// Default tempo: one cycle every two seconds.
pub const DEFAULT_CPS: f64 = 0.5;

/// Tracks the cycle position of rendered audio. Tempo changes apply from the
/// next rendered block onward, so the position never jumps.
#[derive(Debug, Clone)]
pub struct CycleClock {
    cps: f64,
    position: f64,
    frames: u64,
}

impl Default for CycleClock {
    fn default() -> Self {
        Self {
            cps: DEFAULT_CPS,
            position: 0.0,
            frames: 0,
        }
    }
}

impl CycleClock {
    pub fn cps(&self) -> f64 {
        self.cps
    }

    pub fn set_cps(&mut self, cps: f64) -> Result<()> {
        if !cps.is_finite() || cps <= 0.0 {
            return Err(GardenLiveError::Runtime(format!(
                "cycles per second must be positive, got {cps}"
            )));
        }
        self.cps = cps;
        Ok(())
    }

    /// Cycle position of the block start.
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Cycle position `offset` samples after the block start.
    pub fn cycle_at(&self, offset: usize, sample_rate: f64) -> f64 {
        self.position + offset as f64 * self.cps / sample_rate
    }

    pub fn advance(&mut self, frames: usize, sample_rate: f64) {
        self.position = self.cycle_at(frames, sample_rate);
        self.frames += frames as u64;
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_by_cycles() {
        let mut clock = CycleClock::default();
        clock.advance(48_000, 48_000.0);
        assert!((clock.position() - 0.5).abs() < 1e-12);
        assert_eq!(clock.frames(), 48_000);
    }

    #[test]
    fn tempo_change_keeps_position() {
        let mut clock = CycleClock::default();
        clock.advance(1_000, 1_000.0);
        clock.set_cps(2.0).unwrap();
        assert!((clock.position() - 0.5).abs() < 1e-12);
        assert!((clock.cycle_at(500, 1_000.0) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn rejects_non_positive_tempo() {
        let mut clock = CycleClock::default();
        assert!(clock.set_cps(0.0).is_err());
        assert!(clock.set_cps(f64::INFINITY).is_err());
        assert_eq!(clock.cps(), DEFAULT_CPS);
    }

    #[test]
    fn reset_returns_to_origin() {
        let mut clock = CycleClock::default();
        clock.advance(10, 10.0);
        clock.reset();
        assert_eq!(clock.position(), 0.0);
        assert_eq!(clock.frames(), 0);
    }
}
