//! Skips inference on near-identical consecutive input frames.

use candle_core::{DType, Result, Tensor};

/// Cosine-similarity gate over consecutive preprocessed inputs. When the
/// similarity to the previous processed frame exceeds the threshold, the
/// frame is skipped, up to `max_skip_frames` in a row.
pub struct SimilarImageFilter {
    threshold: f32,
    max_skip_frames: usize,
    prev: Option<Tensor>,
    skipped: usize,
}

impl SimilarImageFilter {
    pub fn new(threshold: f32, max_skip_frames: usize) -> Self {
        Self {
            threshold,
            max_skip_frames,
            prev: None,
            skipped: 0,
        }
    }

    pub fn should_skip(&mut self, input: &Tensor) -> Result<bool> {
        let Some(prev) = &self.prev else {
            self.prev = Some(input.clone());
            return Ok(false);
        };

        let similarity = cosine_similarity(prev, input)?;
        if similarity > self.threshold && self.skipped < self.max_skip_frames {
            self.skipped += 1;
            return Ok(true);
        }

        self.prev = Some(input.clone());
        self.skipped = 0;
        Ok(false)
    }
}

fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<f32> {
    let a = a.to_dtype(DType::F32)?.flatten_all()?;
    let b = b.to_dtype(DType::F32)?.flatten_all()?;
    let dot = (&a * &b)?.sum_all()?.to_scalar::<f32>()?;
    let norm_a = (&a * &a)?.sum_all()?.to_scalar::<f32>()?.sqrt();
    let norm_b = (&b * &b)?.sum_all()?.to_scalar::<f32>()?.sqrt();
    Ok(dot / (norm_a * norm_b + f32::EPSILON))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn frame(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn first_frame_is_never_skipped() {
        let mut filter = SimilarImageFilter::new(0.95, 10);
        assert!(!filter.should_skip(&frame(&[1., 2., 3.])).unwrap());
    }

    #[test]
    fn identical_frames_are_skipped() {
        let mut filter = SimilarImageFilter::new(0.95, 10);
        let f = frame(&[1., 2., 3.]);
        assert!(!filter.should_skip(&f).unwrap());
        assert!(filter.should_skip(&f).unwrap());
    }

    #[test]
    fn dissimilar_frames_are_processed() {
        let mut filter = SimilarImageFilter::new(0.95, 10);
        assert!(!filter.should_skip(&frame(&[1., 0., 0.])).unwrap());
        assert!(!filter.should_skip(&frame(&[0., 1., 0.])).unwrap());
    }

    #[test]
    fn skip_run_is_bounded() {
        let mut filter = SimilarImageFilter::new(0.95, 2);
        let f = frame(&[1., 2., 3.]);
        assert!(!filter.should_skip(&f).unwrap());
        assert!(filter.should_skip(&f).unwrap());
        assert!(filter.should_skip(&f).unwrap());
        // Cap reached: the frame is processed and the run resets.
        assert!(!filter.should_skip(&f).unwrap());
        assert!(filter.should_skip(&f).unwrap());
    }
}
