use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Wire-level failure bubbled up from the api crate.
    #[error(transparent)]
    Api(#[from] halox_api::ApiError),
}
