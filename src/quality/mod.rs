mod engine;
mod face;
mod image_metrics;

pub use engine::{MetricImages, MetricScore, QualityEngine, QualityMetric, QualityReport};
pub use face::{FaceAnalyzer, FaceDetection, FaceDetectionConfidence, FaceSimilarity};
pub use image_metrics::{
    ColorDiversity, ColorVibrancy, Contrast, EdgeCleanliness, ResolutionAdequacy, Sharpness,
};

use std::sync::Arc;

use crate::config::QualityConfig;

/// Engine with the built-in image metrics, plus the face metrics when a
/// face analyzer is available.
pub fn default_engine(config: QualityConfig, faces: Option<Arc<dyn FaceAnalyzer>>) -> QualityEngine {
    let engine = QualityEngine::new(config)
        .with_metric(Arc::new(ColorVibrancy))
        .with_metric(Arc::new(EdgeCleanliness::new()))
        .with_metric(Arc::new(ColorDiversity))
        .with_metric(Arc::new(ResolutionAdequacy))
        .with_metric(Arc::new(Sharpness))
        .with_metric(Arc::new(Contrast));

    match faces {
        Some(analyzer) => engine
            .with_metric(Arc::new(FaceSimilarity::new(analyzer.clone())))
            .with_metric(Arc::new(FaceDetectionConfidence::new(analyzer))),
        None => engine,
    }
}
