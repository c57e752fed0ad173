//! services/api/src/bin/openapi.rs
//!
//! Renders the OpenAPI document for the timer REST endpoints.
//! Usage: `openapi [OUTPUT]`, where OUTPUT defaults to `openapi.json`.

use api_lib::{error::ApiError, web::rest::ApiDoc};
use std::path::PathBuf;
use utoipa::OpenApi;

fn main() -> Result<(), ApiError> {
    let output = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("openapi.json"));

    let document = ApiDoc::openapi()
        .to_pretty_json()
        .map_err(|e| ApiError::Internal(format!("Could not render the API document: {}", e)))?;
    if let Some(dir) = output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&output, document)?;

    println!("Timer API document written to {}", output.display());
    Ok(())
}
