//! Frame-granular playout buffer for TTS audio.
//!
//! Incoming chunks rarely align with the playback frame size, so pushes go
//! through a sample accumulator and only whole frames reach the ring. The ring
//! is one contiguous arena allocated up front; nothing allocates after `new`.

use crate::error::{AudioError, Result};
use serde::{Deserialize, Serialize};

/// Jitter buffer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Frames queued before playout starts.
    pub min_frames: usize,
    /// Ring capacity in frames.
    pub max_frames: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_frames: 2,   // 40 ms of cushion before the first frame plays
            max_frames: 25, // 500 ms ceiling; older audio is dropped beyond this
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitterStats {
    pub samples_pushed: u64,
    pub frames_committed: u64,
    pub frames_popped: u64,
    pub underruns: u64,
    pub oldest_drops: u64,
    pub max_depth: usize,
}

pub struct JitterBuffer {
    frame_samples: usize,
    min_frames: usize,
    max_frames: usize,
    arena: Box<[i16]>,
    head: usize,
    depth: usize,
    accumulator: Box<[i16]>,
    accumulated: usize,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(frame_samples: usize, config: JitterConfig) -> Result<Self> {
        if frame_samples == 0 {
            return Err(AudioError::InvalidArgument("frame size is zero".into()));
        }
        if config.max_frames == 0 || config.min_frames > config.max_frames {
            return Err(AudioError::InvalidArgument(format!(
                "jitter frames min {} / max {}",
                config.min_frames, config.max_frames
            )));
        }

        Ok(Self {
            frame_samples,
            min_frames: config.min_frames,
            max_frames: config.max_frames,
            arena: vec![0i16; frame_samples * config.max_frames].into_boxed_slice(),
            head: 0,
            depth: 0,
            accumulator: vec![0i16; frame_samples].into_boxed_slice(),
            accumulated: 0,
            stats: JitterStats::default(),
        })
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn min_frames(&self) -> usize {
        self.min_frames
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Queued whole frames.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Samples waiting in the accumulator, always fewer than one frame.
    pub fn accumulated(&self) -> usize {
        self.accumulated
    }

    pub fn is_ready(&self) -> bool {
        self.depth >= self.min_frames
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0 && self.accumulated == 0
    }

    /// Size of the preallocated storage, in samples.
    pub fn capacity_samples(&self) -> usize {
        self.arena.len() + self.accumulator.len()
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    /// Accept all of `samples`, committing a frame each time the accumulator
    /// fills. Returns `samples.len()`.
    pub fn push(&mut self, samples: &[i16]) -> usize {
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_samples - self.accumulated).min(rest.len());
            self.accumulator[self.accumulated..self.accumulated + take]
                .copy_from_slice(&rest[..take]);
            self.accumulated += take;
            rest = &rest[take..];

            if self.accumulated == self.frame_samples {
                self.commit_accumulator();
            }
        }
        self.stats.samples_pushed += samples.len() as u64;
        samples.len()
    }

    /// Zero-pad a partial accumulator into one last frame.
    /// Returns whether a frame was committed.
    pub fn flush_partial(&mut self) -> bool {
        if self.accumulated == 0 {
            return false;
        }
        self.accumulator[self.accumulated..].fill(0);
        self.commit_accumulator();
        true
    }

    fn commit_accumulator(&mut self) {
        if self.depth == self.max_frames {
            self.head = (self.head + 1) % self.max_frames;
            self.depth -= 1;
            self.stats.oldest_drops += 1;
        }

        let slot = (self.head + self.depth) % self.max_frames;
        let start = slot * self.frame_samples;
        self.arena[start..start + self.frame_samples].copy_from_slice(&self.accumulator);
        self.depth += 1;
        self.accumulated = 0;

        self.stats.frames_committed += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.depth);
    }

    /// Copy the oldest frame into `out`.
    ///
    /// `out` must hold exactly one frame. Returns `true` for a real frame;
    /// `false` is an underrun and `out` is zero-filled.
    pub fn pop_frame(&mut self, out: &mut [i16]) -> bool {
        debug_assert_eq!(out.len(), self.frame_samples);
        let len = out.len().min(self.frame_samples);

        if self.depth == 0 {
            out.fill(0);
            self.stats.underruns += 1;
            return false;
        }

        let start = self.head * self.frame_samples;
        out[..len].copy_from_slice(&self.arena[start..start + len]);
        out[len..].fill(0);
        self.head = (self.head + 1) % self.max_frames;
        self.depth -= 1;
        self.stats.frames_popped += 1;
        true
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.depth = 0;
        self.accumulated = 0;
    }

    pub fn reset_stats(&mut self) {
        self.stats = JitterStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const F: usize = 320;

    fn buffer(min_frames: usize, max_frames: usize) -> JitterBuffer {
        JitterBuffer::new(
            F,
            JitterConfig {
                min_frames,
                max_frames,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(JitterBuffer::new(0, JitterConfig::default()).is_err());
        assert!(JitterBuffer::new(
            F,
            JitterConfig {
                min_frames: 5,
                max_frames: 4
            }
        )
        .is_err());
    }

    #[test]
    fn test_unaligned_pushes_commit_whole_frames() {
        let mut jb = buffer(2, 8);

        assert_eq!(jb.push(&[1; 200]), 200);
        assert_eq!(jb.depth(), 0);
        assert_eq!(jb.accumulated(), 200);

        assert_eq!(jb.push(&[2; 500]), 500);
        // 700 samples = 2 frames + 60 left over
        assert_eq!(jb.depth(), 2);
        assert_eq!(jb.accumulated(), 60);
        assert!(jb.is_ready());

        let mut out = [0i16; F];
        assert!(jb.pop_frame(&mut out));
        assert!(out[..200].iter().all(|&s| s == 1));
        assert!(out[200..].iter().all(|&s| s == 2));
    }

    #[test]
    fn test_commit_count_matches_floor() {
        let mut jb = buffer(1, 64);
        let mut accum = 0usize;
        for k in [1usize, 319, 320, 321, 640, 7, 1000, 0, 313] {
            let before = jb.depth();
            jb.push(&vec![3i16; k]);
            let expected = (accum + k) / F;
            assert_eq!(jb.depth() - before, expected, "push of {k}");
            accum = (accum + k) % F;
            assert_eq!(jb.accumulated(), accum);
        }
    }

    #[test]
    fn test_underrun_zero_fills() {
        let mut jb = buffer(2, 4);
        let mut out = [77i16; F];
        assert!(!jb.pop_frame(&mut out));
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(jb.stats().underruns, 1);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let max = 4;
        let mut jb = buffer(1, max);
        for frame in 0..(2 * max) {
            jb.push(&[frame as i16; F]);
        }

        assert_eq!(jb.depth(), max);
        assert_eq!(jb.stats().oldest_drops, max as u64);

        let mut out = [0i16; F];
        for expected in max..2 * max {
            assert!(jb.pop_frame(&mut out));
            assert_eq!(out[0], expected as i16);
        }
        assert!(!jb.pop_frame(&mut out));
    }

    #[test]
    fn test_flush_partial_pads_tail() {
        let mut jb = buffer(1, 4);
        jb.push(&[9; 100]);
        assert!(jb.flush_partial());
        assert!(!jb.flush_partial());

        let mut out = [0i16; F];
        assert!(jb.pop_frame(&mut out));
        assert!(out[..100].iter().all(|&s| s == 9));
        assert!(out[100..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_reset_clears_ring_and_accumulator() {
        let mut jb = buffer(1, 4);
        jb.push(&[5; F + 10]);
        jb.reset();
        assert_eq!(jb.depth(), 0);
        assert_eq!(jb.accumulated(), 0);
        assert!(jb.is_empty());
    }
}
