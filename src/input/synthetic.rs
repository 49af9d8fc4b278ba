//! 合成热感场景源 (Synthetic source)
//!
//! Deterministic stand-in for the camera: ambient noise floor with an optional
//! hot region over a frame window. Used for soak runs (`--source synthetic`)
//! and by the test suite; seeded so runs are reproducible.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{CameraProfile, FrameSource, ThermalFrame};
use crate::error::CaptureError;

/// What the synthetic sensor "sees".
#[derive(Debug, Clone, Copy)]
pub struct SyntheticScene {
    /// Hot region present for frames in `hot_from..=hot_until` (1-based seq).
    pub hot_from: u64,
    pub hot_until: u64,
    /// Hot rectangle (x, y, w, h) in pixels.
    pub hot_rect: (u32, u32, u32, u32),
    /// Ambient sensor counts.
    pub ambient: u16,
    /// Hot-region sensor counts.
    pub hot: u16,
    /// Uniform jitter amplitude on top of either level.
    pub noise: u16,
}

impl Default for SyntheticScene {
    fn default() -> Self {
        Self {
            hot_from: 0,
            hot_until: 0,
            hot_rect: (120, 80, 60, 60),
            ambient: 7200,
            hot: 9800,
            noise: 40,
        }
    }
}

pub struct SyntheticSource {
    profile: CameraProfile,
    scene: SyntheticScene,
    rng: StdRng,
    next_seq: u64,
    /// Pace emission to the profile's fps; off in tests.
    paced: bool,
    last_emit: Instant,
}

impl SyntheticSource {
    pub fn new(profile: CameraProfile, scene: SyntheticScene, seed: u64, paced: bool) -> Self {
        Self {
            profile,
            scene,
            rng: StdRng::seed_from_u64(seed),
            next_seq: 0,
            paced,
            last_emit: Instant::now(),
        }
    }

    /// Paced source with the default scene, for `--source synthetic`.
    pub fn ambient(profile: CameraProfile) -> Self {
        Self::new(profile, SyntheticScene::default(), 0x5EEB, true)
    }

    fn render(&mut self, seq: u64) -> Vec<u16> {
        let w = self.profile.width as usize;
        let h = self.profile.height as usize;
        let scene = self.scene;
        let mut pixels = vec![0u16; w * h];
        for px in pixels.iter_mut() {
            *px = scene.ambient + self.rng.gen_range(0..=scene.noise);
        }
        if seq >= scene.hot_from && seq <= scene.hot_until {
            let (rx, ry, rw, rh) = scene.hot_rect;
            for y in ry..(ry + rh).min(self.profile.height) {
                for x in rx..(rx + rw).min(self.profile.width) {
                    pixels[y as usize * w + x as usize] =
                        scene.hot + self.rng.gen_range(0..=scene.noise);
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn profile(&self) -> CameraProfile {
        self.profile
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<ThermalFrame, CaptureError> {
        if self.paced {
            let cadence = Duration::from_secs_f64(1.0 / self.profile.fps.max(1) as f64);
            let since = self.last_emit.elapsed();
            if since < cadence {
                std::thread::sleep(cadence - since);
            }
            self.last_emit = Instant::now();
        }
        let seq = self.next_seq + 1;
        let pixels = self.render(seq);
        self.next_seq = seq;
        Ok(ThermalFrame {
            seq,
            captured_at: chrono::Utc::now(),
            width: self.profile.width,
            height: self.profile.height,
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CameraProfile {
        CameraProfile {
            width: 32,
            height: 24,
            fps: 9,
        }
    }

    #[test]
    fn test_seqs_strictly_increasing() {
        let mut src = SyntheticSource::new(profile(), SyntheticScene::default(), 1, false);
        let mut last = 0;
        for _ in 0..20 {
            let frame = src.next_frame(Duration::from_millis(1)).unwrap();
            assert!(frame.seq > last);
            last = frame.seq;
        }
    }

    #[test]
    fn test_seeded_runs_identical() {
        let mut a = SyntheticSource::new(profile(), SyntheticScene::default(), 42, false);
        let mut b = SyntheticSource::new(profile(), SyntheticScene::default(), 42, false);
        for _ in 0..5 {
            let fa = a.next_frame(Duration::from_millis(1)).unwrap();
            let fb = b.next_frame(Duration::from_millis(1)).unwrap();
            assert_eq!(fa.pixels, fb.pixels);
        }
    }

    #[test]
    fn test_hot_window_raises_counts() {
        let scene = SyntheticScene {
            hot_from: 2,
            hot_until: 3,
            hot_rect: (0, 0, 8, 8),
            ..SyntheticScene::default()
        };
        let mut src = SyntheticSource::new(profile(), scene, 7, false);
        let cold = src.next_frame(Duration::from_millis(1)).unwrap();
        let hot = src.next_frame(Duration::from_millis(1)).unwrap();
        assert!(cold.pixels[0] < scene.hot);
        assert!(hot.pixels[0] >= scene.hot);
    }
}
