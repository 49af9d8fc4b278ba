//! 帧预处理 (Preprocessing stage)
//!
//! Pure function from a raw thermal frame to the NCHW tensor the detector
//! expects: geometry validation, resize, min-max normalization against the
//! calibrated sensor bounds, single channel replicated to three.

use chrono::{DateTime, Utc};
use fast_image_resize as fr;
use ndarray::{Array, IxDyn};

use crate::error::PreprocessError;
use crate::input::{CameraProfile, ThermalFrame};

/// What the loaded model requires of its input, plus the camera profile every
/// incoming frame must match.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub input_width: u32,
    pub input_height: u32,
    /// Camera profile frames are validated against.
    pub camera: CameraProfile,
    /// Calibrated sensor counts mapped to 0.0.
    pub calib_lo: u16,
    /// Calibrated sensor counts mapped to 1.0.
    pub calib_hi: u16,
}

/// Model-ready tensor plus traceability back to its source frame. Owns no
/// frame data.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInput {
    /// NCHW, shape (1, 3, input_height, input_width), values in [0, 1].
    pub data: Array<f32, IxDyn>,
    pub frame_seq: u64,
    pub captured_at: DateTime<Utc>,
    pub src_width: u32,
    pub src_height: u32,
}

/// Deterministic: the same frame always yields a byte-identical tensor.
pub fn transform(frame: &ThermalFrame, spec: &ModelSpec) -> Result<TensorInput, PreprocessError> {
    let expected_len = (frame.width * frame.height) as usize;
    if frame.width != spec.camera.width
        || frame.height != spec.camera.height
        || frame.pixels.len() != expected_len
    {
        return Err(PreprocessError::MalformedFrame {
            seq: frame.seq,
            got_width: frame.width,
            got_height: frame.height,
            got_len: frame.pixels.len(),
            want_width: spec.camera.width,
            want_height: spec.camera.height,
        });
    }

    let resized = if frame.width == spec.input_width && frame.height == spec.input_height {
        frame.pixels.clone()
    } else {
        resize_u16(
            &frame.pixels,
            frame.width,
            frame.height,
            spec.input_width,
            spec.input_height,
        )
    };

    let lo = spec.calib_lo as f32;
    let hi = spec.calib_hi as f32;
    let span = (hi - lo).max(1.0);

    let h = spec.input_height as usize;
    let w = spec.input_width as usize;
    let mut data = Array::zeros((1, 3, h, w)).into_dyn();
    for y in 0..h {
        for x in 0..w {
            let v = ((resized[y * w + x] as f32 - lo) / span).clamp(0.0, 1.0);
            data[[0, 0, y, x]] = v;
            data[[0, 1, y, x]] = v;
            data[[0, 2, y, x]] = v;
        }
    }

    Ok(TensorInput {
        data,
        frame_seq: frame.seq,
        captured_at: frame.captured_at,
        src_width: frame.width,
        src_height: frame.height,
    })
}

/// Nearest-neighbour resize of raw u16 counts. Nearest keeps sensor values
/// intact instead of blending temperatures across edges.
fn resize_u16(pixels: &[u16], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<u16> {
    let src_bytes: Vec<u8> = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
    let src_image = fr::images::Image::from_vec_u8(src_w, src_h, src_bytes, fr::PixelType::U16)
        .expect("source buffer matches declared geometry");

    let mut dst_image = fr::images::Image::new(dst_w, dst_h, fr::PixelType::U16);
    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src_image,
            &mut dst_image,
            &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Nearest),
        )
        .expect("u16 nearest resize");

    dst_image
        .buffer()
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ModelSpec {
        ModelSpec {
            input_width: 16,
            input_height: 16,
            camera: CameraProfile {
                width: 32,
                height: 24,
                fps: 9,
            },
            calib_lo: 7000,
            calib_hi: 10000,
        }
    }

    fn frame(seq: u64, fill: u16) -> ThermalFrame {
        ThermalFrame::new(seq, 32, 24, vec![fill; 32 * 24])
    }

    #[test]
    fn test_transform_deterministic() {
        let f = frame(1, 8200);
        let a = transform(&f, &spec()).unwrap();
        let b = transform(&f, &spec()).unwrap();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_rejects_wrong_geometry() {
        let f = ThermalFrame::new(3, 16, 16, vec![0; 256]);
        match transform(&f, &spec()) {
            Err(PreprocessError::MalformedFrame { seq, .. }) => assert_eq!(seq, 3),
            other => panic!("expected MalformedFrame, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_truncated_pixels() {
        let mut f = frame(4, 8000);
        f.pixels.truncate(10);
        assert!(transform(&f, &spec()).is_err());
    }

    #[test]
    fn test_normalization_bounds() {
        let s = spec();
        let lo = transform(&frame(1, s.calib_lo), &s).unwrap();
        let hi = transform(&frame(2, s.calib_hi), &s).unwrap();
        let over = transform(&frame(3, u16::MAX), &s).unwrap();
        assert_eq!(lo.data[[0, 0, 0, 0]], 0.0);
        assert_eq!(hi.data[[0, 0, 0, 0]], 1.0);
        assert_eq!(over.data[[0, 0, 0, 0]], 1.0);
    }

    #[test]
    fn test_channels_replicated() {
        let t = transform(&frame(1, 8500), &spec()).unwrap();
        for y in 0..4 {
            for x in 0..4 {
                let v = t.data[[0, 0, y, x]];
                assert_eq!(t.data[[0, 1, y, x]], v);
                assert_eq!(t.data[[0, 2, y, x]], v);
            }
        }
    }

    #[test]
    fn test_traceability_back_reference() {
        let f = frame(42, 8000);
        let t = transform(&f, &spec()).unwrap();
        assert_eq!(t.frame_seq, 42);
        assert_eq!(t.src_width, 32);
        assert_eq!(t.src_height, 24);
        assert_eq!(t.data.shape(), &[1, 3, 16, 16]);
    }
}
