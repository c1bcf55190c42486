use std::path::PathBuf;
use std::sync::Arc;

use puzzlecraft::collaborators::JsonlConsentLedger;
use puzzlecraft::{AppError, Configuration, FulfillmentService, JobRequest, Orchestrator};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "PUZZLECRAFT_CONFIG";

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn usage() -> AppError {
    AppError::InvalidSubmission("usage: puzzlecraft <request.json> [config.toml]".to_string())
}

fn read_request(path: &PathBuf) -> Result<JobRequest, AppError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::InvalidSubmission(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::InvalidSubmission(format!("malformed request {}: {}", path.display(), e)))
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let mut args = std::env::args().skip(1);
    let request_path = args.next().map(PathBuf::from).ok_or_else(usage)?;
    let config_path = args
        .next()
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from);

    let configuration = Configuration::load(config_path.as_deref())?;
    init_logging(&configuration.log_level);

    let request = read_request(&request_path)?;
    let mut builder = Orchestrator::builder(configuration.clone());
    match &configuration.storage.consent_log {
        Some(log) => builder = builder.consent(Arc::new(JsonlConsentLedger::new(log.clone()))),
        None if !request.skip_consent => {
            warn!("No consent log configured; order {} will be rejected", request.order_id)
        }
        None => {}
    }
    let service = FulfillmentService::new(builder.build()?);

    let resumed = service.resume_pending();
    let id = service.submit(request).await?;
    for pending in resumed {
        let job = service.wait(pending).await?;
        info!("Resumed job {} ended as {}", job.id, job.status);
    }

    let job = service.wait(id).await?;
    match job.failure_reason() {
        Some(reason) => warn!("Order {} failed: {}", job.order_id, reason),
        None => info!("Job {} ended as {} (cost {:.3})", job.id, job.status, job.total_cost()),
    }
    if job.below_threshold {
        warn!("Order {} finished below the quality threshold; flagged for manual review", job.order_id);
    }

    match serde_json::to_string_pretty(&job.summary()) {
        Ok(summary) => println!("{}", summary),
        Err(e) => warn!("Cannot render summary: {}", e),
    }
    Ok(())
}
