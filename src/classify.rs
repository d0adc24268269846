//! Color histogram based crash detection.
//!
//! Panic screens are text mode or flat color renders, a live desktop or a boot
//! splash shows many more distinct colors. The threshold between the two is an
//! empirical value, not a guarantee.
use crate::frame::{Rgba, Screenshot};

use rustc_hash::FxHashMap;

/// Frames with fewer distinct colors than this are considered crashed.
pub const DEFAULT_CRASH_THRESHOLD: usize = 30;

/// Occurrence count of every distinct color of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    counts: FxHashMap<Rgba, u64>,
}

impl Histogram {
    pub fn of(shot: &Screenshot) -> Self {
        let mut counts = FxHashMap::default();
        for px in shot.pixels() {
            *counts.entry(px).or_insert(0) += 1;
        }
        Self { counts }
    }

    /// Number of distinct colors.
    #[inline]
    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    /// Sum of all counts, equals to the pixel count of the frame.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn count(&self, color: Rgba) -> u64 {
        self.counts.get(&color).copied().unwrap_or(0)
    }

    /// Colors ordered by count, most common first.
    pub fn most_common(&self) -> Vec<(Rgba, u64)> {
        let mut colors = self
            .counts
            .iter()
            .map(|(c, n)| (*c, *n))
            .collect::<Vec<_>>();
        colors.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        colors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Crashed,
}

#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    threshold: usize,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_CRASH_THRESHOLD)
    }
}

impl Classifier {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn classify(&self, hist: &Histogram) -> Verdict {
        if hist.distinct() < self.threshold {
            Verdict::Crashed
        } else {
            Verdict::Healthy
        }
    }
}

#[cfg(test)]
pub(crate) fn frame_with_colors(width: u32, height: u32, colors: usize) -> Screenshot {
    assert!(colors >= 1 && colors <= width as usize * height as usize);
    let pixels = (0..width as usize * height as usize)
        .map(|i| {
            let c = (i % colors) as u32;
            [c as u8, (c >> 8) as u8, (c >> 16) as u8, 255]
        })
        .collect::<Vec<_>>();
    Screenshot::from_pixels(width, height, &pixels)
}
