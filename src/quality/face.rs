use image::DynamicImage;
use std::sync::Arc;

use super::engine::{MetricImages, QualityMetric};
use crate::error::MetricError;

#[derive(Debug, Clone, PartialEq)]
pub struct FaceDetection {
    pub embedding: Vec<f32>,
    /// Detector confidence in `0..=1`.
    pub confidence: f32,
}

/// Face detection + embedding model. Heavy and optional: without one the
/// face metrics report themselves unavailable.
pub trait FaceAnalyzer: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceDetection>, MetricError>;
}

fn primary_face(
    analyzer: &dyn FaceAnalyzer,
    metric: &str,
    image: &DynamicImage,
    which: &str,
) -> Result<FaceDetection, MetricError> {
    analyzer
        .detect(image)?
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .ok_or_else(|| MetricError::unavailable(metric, format!("no face detected in {}", which)))
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

/// Likeness between the customer's face and the generated face; cosine
/// similarity mapped from `[-1, 1]` onto `[0, 100]`.
pub struct FaceSimilarity {
    analyzer: Arc<dyn FaceAnalyzer>,
}

impl FaceSimilarity {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        Self { analyzer }
    }
}

impl QualityMetric for FaceSimilarity {
    fn name(&self) -> &str {
        "face_similarity"
    }

    fn compute(&self, images: &MetricImages<'_>) -> Result<f64, MetricError> {
        let source = primary_face(self.analyzer.as_ref(), self.name(), images.original, "original")?;
        let generated =
            primary_face(self.analyzer.as_ref(), self.name(), images.candidate, "candidate")?;
        let similarity = cosine_similarity(&source.embedding, &generated.embedding)
            .ok_or_else(|| MetricError::unavailable(self.name(), "incomparable embeddings"))?;
        Ok(((similarity + 1.0) * 50.0).clamp(0.0, 100.0))
    }
}

/// Whether a well-formed face survived the transformation.
pub struct FaceDetectionConfidence {
    analyzer: Arc<dyn FaceAnalyzer>,
}

impl FaceDetectionConfidence {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        Self { analyzer }
    }
}

impl QualityMetric for FaceDetectionConfidence {
    fn name(&self) -> &str {
        "face_detection_confidence"
    }

    fn compute(&self, images: &MetricImages<'_>) -> Result<f64, MetricError> {
        let face = primary_face(self.analyzer.as_ref(), self.name(), images.candidate, "candidate")?;
        Ok((face.confidence as f64 * 100.0).clamp(0.0, 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::PrintDimensions;
    use crate::testing::solid_image;

    /// Returns one scripted face per call, keyed by image width.
    struct WidthKeyedAnalyzer;

    impl FaceAnalyzer for WidthKeyedAnalyzer {
        fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceDetection>, MetricError> {
            Ok(match image.width() {
                10 => vec![
                    FaceDetection { embedding: vec![0.0, 1.0], confidence: 0.2 },
                    FaceDetection { embedding: vec![1.0, 0.0], confidence: 0.9 },
                ],
                20 => vec![FaceDetection { embedding: vec![1.0, 0.0], confidence: 0.75 }],
                30 => vec![FaceDetection { embedding: vec![-1.0, 0.0], confidence: 0.5 }],
                _ => Vec::new(),
            })
        }
    }

    fn score<M: QualityMetric>(metric: &M, original: u32, candidate: u32) -> Result<f64, MetricError> {
        let original = solid_image(original, 4, [0, 0, 0]);
        let candidate = solid_image(candidate, 4, [0, 0, 0]);
        metric.compute(&MetricImages {
            original: &original,
            candidate: &candidate,
            print_target: PrintDimensions { width: 1, height: 1 },
        })
    }

    #[test]
    fn test_identical_faces_score_full_marks() {
        let metric = FaceSimilarity::new(Arc::new(WidthKeyedAnalyzer));
        assert_eq!(score(&metric, 10, 20).unwrap(), 100.0);
    }

    #[test]
    fn test_opposite_faces_score_zero() {
        let metric = FaceSimilarity::new(Arc::new(WidthKeyedAnalyzer));
        assert_eq!(score(&metric, 10, 30).unwrap(), 0.0);
    }

    #[test]
    fn test_missing_face_is_unavailable() {
        let metric = FaceSimilarity::new(Arc::new(WidthKeyedAnalyzer));
        assert!(matches!(score(&metric, 10, 40), Err(MetricError::Unavailable { .. })));
    }

    #[test]
    fn test_detection_confidence_uses_best_face() {
        let metric = FaceDetectionConfidence::new(Arc::new(WidthKeyedAnalyzer));
        assert_eq!(score(&metric, 40, 20).unwrap(), 75.0);
        assert!((score(&metric, 40, 10).unwrap() - 90.0).abs() < 1e-4);
    }

    #[test]
    fn test_cosine_rejects_mismatched_lengths() {
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_none());
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_none());
    }
}
