//! `forgeflow status`: run reports as JSON.

use anyhow::Result;
use forgeflow::config::ForgeflowConfig;
use forgeflow::errors::OrchestratorError;

use super::open_db;

pub fn cmd_status(config: &ForgeflowConfig, run_id: Option<&str>) -> Result<()> {
    let handle = open_db(config)?;
    let db = handle.lock_sync()?;

    let json = match run_id {
        Some(id) => {
            let report = db
                .run_report(id)?
                .ok_or_else(|| OrchestratorError::RunNotFound { id: id.to_string() })?;
            serde_json::to_string_pretty(&report)?
        }
        None => serde_json::to_string_pretty(&db.list_feature_runs()?)?,
    };
    println!("{}", json);
    Ok(())
}
