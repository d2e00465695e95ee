//! Metadata catalogs that records are registered into and patched through.
//!
//! A [`Catalog`] assigns the final identifier of a record on registration and accepts
//! batch edits addressed by locator. Two implementations ship with the crate:
//!
//! - [`GeoNetworkClient`]: the GeoNetwork REST API (`/records`, `/records/batchediting`).
//! - [`MemoryCatalog`]: an in-process catalog for tests and dry runs. Patches are applied to
//!   the stored documents with [`crate::resolver::apply_edit`].
//!
//! Catalog calls are async; the batch orchestrator awaits them one at a time.

pub mod geonetwork;
pub mod memory;

pub use geonetwork::GeoNetworkClient;
pub use memory::{CatalogOperation, FailOn, MemoryCatalog};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    error::RecordError,
    resolver::{EditDirective, PatchOperation},
};

/// Errors from catalog operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// Login did not yield a session (no XSRF token, bad credentials).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The addressed record or route does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The catalog answered with an error status.
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// The catalog accepted the request but reported errors in its body.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("network error: {0}")]
    NetworkError(String),
}

impl CatalogError {
    pub fn into_registration(self, local_id: impl Into<String>) -> RecordError {
        RecordError::Registration {
            local_id: local_id.into(),
            message: self.to_string(),
        }
    }

    pub fn into_patch(self, owner: impl Into<String>) -> RecordError {
        RecordError::Patch {
            owner: owner.into(),
            message: self.to_string(),
        }
    }
}

impl From<reqwest::Error> for CatalogError {
    fn from(src: reqwest::Error) -> CatalogError {
        match src.status() {
            Some(status) => CatalogError::ApiError {
                status: status.as_u16(),
                message: src.to_string(),
            },
            None if src.is_decode() => CatalogError::InvalidResponse(src.to_string()),
            None => CatalogError::NetworkError(src.to_string()),
        }
    }
}

/// A metadata catalog.
///
/// Implementations must be `Send + Sync` so a catalog can be shared by the orchestrator and
/// the CLI runtime.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Short name used in logs ("geonetwork", "memory").
    fn name(&self) -> &'static str;

    /// Register a serialized record and return the final identifier the catalog assigned.
    ///
    /// `local_id` is the batch-local name of the record. It is only used for reporting and
    /// by catalogs that pre-assign identifiers.
    async fn register(&self, local_id: &str, xml: &str) -> Result<String, CatalogError>;

    /// Apply one edit to a registered record.
    ///
    /// `payload` is the bare fragment; the catalog wraps it in the directive's tag when its
    /// API requires it.
    async fn patch(
        &self,
        owner_final: &str,
        locator: &str,
        payload: &str,
        directive: EditDirective,
    ) -> Result<(), CatalogError>;

    /// Remove records by final identifier.
    async fn delete(&self, final_ids: &[String]) -> Result<(), CatalogError>;

    /// Submit a resolved patch operation.
    async fn submit(&self, operation: &PatchOperation) -> Result<(), CatalogError> {
        self.patch(
            &operation.owner_final,
            &operation.locator,
            &operation.payload,
            operation.directive,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_errors_convert_at_the_boundary() {
        let err = CatalogError::ApiError {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(
            err.clone().into_registration("doc-a"),
            RecordError::Registration {
                local_id: "doc-a".to_string(),
                message: "API error: 500 - boom".to_string(),
            }
        );
        assert!(matches!(err.into_patch("doc-b"), RecordError::Patch { ref owner, .. } if owner == "doc-b"));
    }
}
