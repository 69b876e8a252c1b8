use crate::visualizer::BarFrame;

/// Height an idle bar collapses to, as a fraction of full scale.
pub const MIN_BAR_HEIGHT: f32 = 0.05;

const BLOCKS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
const PEAK_MARK: char = '▔';

/// `(bar, peak)` heights to draw for `frame`. Idle frames show flat bars and
/// no peaks whatever the numbers say.
pub fn display_heights(frame: &BarFrame) -> Vec<(f32, f32)> {
    if !frame.playing {
        return vec![(MIN_BAR_HEIGHT, 0.0); frame.amplitudes.len()];
    }

    frame
        .amplitudes
        .iter()
        .zip(&frame.peaks)
        .map(|(&amplitude, &peak)| (amplitude.clamp(0.0, 1.0), peak.clamp(0.0, 1.0)))
        .collect()
}

/// Draws bar frames as rows of Unicode block characters.
#[derive(Debug, Clone)]
pub struct BarRenderer {
    rows: usize,
}

impl Default for BarRenderer {
    fn default() -> Self {
        Self { rows: 8 }
    }
}

impl BarRenderer {
    pub fn new(rows: usize) -> Self {
        Self { rows: rows.max(1) }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Renders `frame` top row first, one column per bar, rows joined by
    /// newlines.
    pub fn render(&self, frame: &BarFrame) -> String {
        let heights = display_heights(frame);
        let steps = (BLOCKS.len() - 1) as f32;
        let mut out = String::with_capacity((heights.len() + 1) * self.rows * 3);

        for row in (0..self.rows).rev() {
            for &(bar, peak) in &heights {
                let filled = bar * self.rows as f32 - row as f32;
                let peak_row = (peak * self.rows as f32).ceil() as usize;
                let cell = if filled >= 1.0 {
                    BLOCKS[BLOCKS.len() - 1]
                } else if filled > 0.0 {
                    BLOCKS[((filled * steps).round() as usize).max(1)]
                } else if peak > 0.0 && peak_row == row + 1 {
                    PEAK_MARK
                } else {
                    BLOCKS[0]
                };
                out.push(cell);
            }
            if row > 0 {
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(amplitudes: Vec<f32>, peaks: Vec<f32>, playing: bool) -> BarFrame {
        BarFrame {
            amplitudes,
            peaks,
            playing,
        }
    }

    #[test]
    fn idle_frames_collapse_to_minimum() {
        let heights = display_heights(&frame(vec![0.9, 0.4], vec![1.0, 0.5], false));
        assert_eq!(heights, vec![(MIN_BAR_HEIGHT, 0.0); 2]);
    }

    #[test]
    fn playing_frames_pass_through() {
        let heights = display_heights(&frame(vec![0.9, 0.4], vec![1.0, 0.5], true));
        assert_eq!(heights, vec![(0.9, 1.0), (0.4, 0.5)]);
    }

    #[test]
    fn renders_full_and_empty_columns() {
        let renderer = BarRenderer::new(2);
        let out = renderer.render(&frame(vec![1.0, 0.0], vec![1.0, 0.0], true));
        assert_eq!(out, "█ \n█ ");
    }

    #[test]
    fn peaks_float_above_bars() {
        let renderer = BarRenderer::new(4);
        let out = renderer.render(&frame(vec![0.25], vec![1.0], true));
        let rows: Vec<&str> = out.lines().collect();
        assert_eq!(rows, vec!["▔", " ", " ", "█"]);
    }

    #[test]
    fn idle_bars_draw_a_sliver() {
        let renderer = BarRenderer::new(1);
        let out = renderer.render(&frame(vec![0.0; 3], vec![0.0; 3], false));
        assert_eq!(out.chars().count(), 3);
        assert!(out.chars().all(|c| c != ' '));
    }
}
