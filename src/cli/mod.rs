//! CLI command bodies: initialize the database, print stats, check health.

use anyhow::{Context, Result};

use crate::config::EngramConfig;
use crate::service::MemoryService;

/// Create (or migrate) the database at the configured URL.
pub fn init(config: &EngramConfig) -> Result<()> {
    let service = MemoryService::new(config.clone());
    service
        .initialize()
        .context("failed to initialize the memory store")?;
    let health = service.health_check()?;
    println!(
        "Initialized {} (schema v{})",
        config.database.url, health.schema_version
    );
    service.shutdown();
    Ok(())
}

/// Print aggregated pool, cache, and index statistics as JSON.
pub fn stats(config: &EngramConfig) -> Result<()> {
    let service = MemoryService::new(config.clone());
    service.initialize()?;
    let stats = service.get_stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    service.shutdown();
    Ok(())
}

/// Run a health check and exit non-zero on failure.
pub fn health(config: &EngramConfig) -> Result<()> {
    let service = MemoryService::new(config.clone());
    service.initialize()?;
    let report = service.health_check()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    service.shutdown();
    anyhow::ensure!(report.healthy, "database health check failed");
    Ok(())
}
