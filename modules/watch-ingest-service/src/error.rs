//! Error kinds for the ingestion pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Trigger body missing or missing required fields.
    #[error("{0}")]
    MalformedRequest(String),

    /// No watch configuration matches the requested name.
    #[error("The watch {0} does not exist.")]
    UnknownWatch(String),

    /// Provider response body was not decodable as structured data.
    #[error("API did not return a JSON-formatted body.")]
    UpstreamFormat,

    /// Provider returned a structured error body.
    #[error("API-response: {status} - {detail}")]
    UpstreamApi { status: i64, detail: String },

    /// Enrichment call failed. Absorbed per record, never aborts a page.
    #[error("enrichment failed: {0}")]
    Enrichment(String),

    /// One or more writes in a page batch did not apply.
    #[error("persistence batch failed: {0}")]
    PersistenceBatch(#[source] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}
