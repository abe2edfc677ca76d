//! CLI command implementations.
//!
//! | Module    | Commands handled  |
//! |-----------|-------------------|
//! | `run`     | `Run`, `Resume`   |
//! | `respond` | `Respond`         |
//! | `status`  | `Status`          |

pub mod respond;
pub mod run;
pub mod status;

use anyhow::Result;
use forgeflow::config::ForgeflowConfig;
use forgeflow::factory::db::{DbHandle, FlowDb};

pub use respond::{Answer, cmd_respond};
pub use run::{cmd_resume, cmd_run};
pub use status::cmd_status;

/// Open the configured database, creating it on first use.
pub fn open_db(config: &ForgeflowConfig) -> Result<DbHandle> {
    let db = FlowDb::new(&config.storage.db_path)?;
    Ok(DbHandle::new(db))
}
