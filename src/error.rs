use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Token signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("'The date supplied {date} is invalid'")]
    InvalidDate { date: String },

    #[error("The start date: '{start_date}' is greater than the end date: '{end_date}'")]
    StartDateAfterEndDate {
        start_date: String,
        end_date: String,
    },

    #[error("API request failed: {0}")]
    ApiFailure(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("{source_name} responded with status {status}: {body}")]
    UnexpectedStatus {
        source_name: String,
        status: u16,
        body: String,
    },

    #[error("{source_name} returned an unexpected payload: {payload}")]
    UnexpectedPayload {
        source_name: String,
        payload: String,
    },

    #[error("{source_name} returned an empty report")]
    EmptyReport { source_name: String },

    #[error("Report was not ready after {attempts} polls")]
    PollTimeout { attempts: u32 },

    #[error("Column '{column}' is missing from {source_name}")]
    MissingColumn { source_name: String, column: String },

    #[error("Table id '{table_id}' must look like project.dataset.table")]
    InvalidTableId { table_id: String },

    #[error("Warehouse rejected the request: {message}")]
    Warehouse { message: String },

    #[error("No Google credentials configured, set a service account key or an access token")]
    MissingCredentials,
}
