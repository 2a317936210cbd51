//! `bulkflow run` - execute an ingestion request file

use bulkflow_engine::IngestRequest;
use std::io::Read;
use std::path::Path;
use tracing::debug;

use super::{ingest, Invocation};
use crate::error::{CliError, Result};

/// Parse a request from `path`, or from stdin when `path` is "-"
pub fn read_request(path: &Path) -> Result<IngestRequest> {
    let contents = if path.as_os_str() == "-" {
        let mut contents = String::new();
        std::io::stdin().read_to_string(&mut contents)?;
        contents
    } else {
        if !path.exists() {
            return Err(CliError::FileNotFound(path.display().to_string()));
        }
        std::fs::read_to_string(path)?
    };
    let request: IngestRequest = serde_json::from_str(&contents)?;
    debug!(source = %request.source_type.as_str(), table = %request.table, "Request parsed");
    Ok(request)
}

pub async fn run(path: &Path, invocation: Invocation) -> Result<()> {
    let request = read_request(path)?;
    ingest(request, invocation).await.map(|_| ())
}
