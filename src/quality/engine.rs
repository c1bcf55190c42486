use chrono::{DateTime, Utc};
use image::DynamicImage;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::QualityConfig;
use crate::error::MetricError;
use crate::export::PrintDimensions;

/// Images a metric gets to look at.
pub struct MetricImages<'a> {
    pub original: &'a DynamicImage,
    pub candidate: &'a DynamicImage,
    pub print_target: PrintDimensions,
}

/// An independent quality signal scored on `0..=100`.
pub trait QualityMetric: Send + Sync {
    fn name(&self) -> &str;

    fn compute(&self, images: &MetricImages<'_>) -> Result<f64, MetricError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScore {
    pub name: String,
    pub score: f64,
    pub weight: f64,
    /// Weight after renormalizing over the metrics that produced a score.
    pub effective_weight: f64,
    pub available: bool,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub attempt: u32,
    pub artifact_uri: String,
    pub metrics: Vec<MetricScore>,
    pub composite: f64,
    pub threshold: f64,
    pub pass: bool,
    pub scored_at: DateTime<Utc>,
}

impl QualityReport {
    pub fn for_attempt(mut self, attempt: u32, artifact_uri: impl Into<String>) -> Self {
        self.attempt = attempt;
        self.artifact_uri = artifact_uri.into();
        self
    }

    pub fn unavailable_metrics(&self) -> impl Iterator<Item = &MetricScore> {
        self.metrics.iter().filter(|metric| !metric.available)
    }
}

const WEIGHT_EPSILON: f64 = 1e-9;

pub struct QualityEngine {
    metrics: IndexMap<String, Arc<dyn QualityMetric>>,
    config: QualityConfig,
}

impl QualityEngine {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            metrics: IndexMap::new(),
            config,
        }
    }

    pub fn with_metric(mut self, metric: Arc<dyn QualityMetric>) -> Self {
        self.metrics.insert(metric.name().to_string(), metric);
        self
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Scores every weighted metric. A metric that fails, is missing or
    /// yields a non-finite value is flagged and dropped from the composite;
    /// the remaining weights are renormalized to sum to one.
    pub fn score(
        &self,
        original: &DynamicImage,
        candidate: &DynamicImage,
        print_target: PrintDimensions,
    ) -> QualityReport {
        let images = MetricImages {
            original,
            candidate,
            print_target,
        };

        let mut metrics: Vec<MetricScore> = self
            .config
            .weights
            .iter()
            .map(|(name, weight)| {
                let computed = match self.metrics.get(name.as_str()) {
                    Some(metric) => metric.compute(&images),
                    None => Err(MetricError::unavailable(name.as_str(), "no metric registered")),
                };

                match computed {
                    Ok(score) if score.is_finite() => MetricScore {
                        name: name.clone(),
                        score: score.clamp(0.0, 100.0),
                        weight: *weight,
                        effective_weight: 0.0,
                        available: true,
                        note: None,
                    },
                    Ok(score) => unavailable(name, *weight, format!("non-finite score {}", score)),
                    Err(e) => {
                        warn!("Quality metric {} unavailable: {}", name, e);
                        unavailable(name, *weight, e.to_string())
                    }
                }
            })
            .collect();

        let available_weight: f64 = metrics
            .iter()
            .filter(|metric| metric.available)
            .map(|metric| metric.weight)
            .sum();

        let composite = if available_weight <= WEIGHT_EPSILON {
            0.0
        } else {
            // Already normalized: keep the direct weighted sum untouched.
            let divisor = if (available_weight - 1.0).abs() < WEIGHT_EPSILON {
                1.0
            } else {
                available_weight
            };
            for metric in metrics.iter_mut().filter(|metric| metric.available) {
                metric.effective_weight = metric.weight / divisor;
            }
            let weighted: f64 = metrics
                .iter()
                .filter(|metric| metric.available)
                .map(|metric| metric.weight * metric.score)
                .sum();
            (weighted / divisor).clamp(0.0, 100.0)
        };

        let pass = composite >= self.config.threshold;
        debug!(
            "Composite {:.1} against threshold {:.1} ({})",
            composite,
            self.config.threshold,
            if pass { "pass" } else { "below threshold" }
        );

        QualityReport {
            attempt: 0,
            artifact_uri: String::new(),
            metrics,
            composite,
            threshold: self.config.threshold,
            pass,
            scored_at: Utc::now(),
        }
    }
}

fn unavailable(name: &str, weight: f64, note: String) -> MetricScore {
    MetricScore {
        name: name.to_string(),
        score: 0.0,
        weight,
        effective_weight: 0.0,
        available: false,
        note: Some(note),
    }
}
