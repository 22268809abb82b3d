//! Registry operations the rehoming pipeline depends on.

pub mod cli;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::reference::ImageReference;

/// A failed registry operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("pull {reference} failed: {message}")]
    Pull { reference: String, message: String },

    #[error("tag {from} as {to} failed: {message}")]
    Tag {
        from: String,
        to: String,
        message: String,
    },

    #[error("push {reference} failed: {message}")]
    Push {
        reference: String,
        message: String,
        /// Worth retrying (network hiccup) as opposed to e.g. an auth failure
        transient: bool,
    },

    #[error("cancelled")]
    Cancelled,
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Push { transient: true, .. })
    }
}

impl Serialize for RegistryError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Pull, tag and push against container registries.
///
/// Implementations used with a worker pool larger than one must tolerate
/// concurrent calls; report `false` from [`supports_concurrency`] otherwise
/// and the pipeline will run one reference at a time.
///
/// [`supports_concurrency`]: RegistryClient::supports_concurrency
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn pull(&self, image: &ImageReference) -> Result<(), RegistryError>;

    async fn tag(&self, from: &ImageReference, to: &ImageReference) -> Result<(), RegistryError>;

    async fn push(&self, image: &ImageReference) -> Result<(), RegistryError>;

    fn supports_concurrency(&self) -> bool {
        true
    }
}
