// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Typed error surface for the service loop, wrapping the narrower
//! [`crate::layout::LayoutError`] and the originating capture/SHM error
//! where one exists.

use crate::layout::LayoutError;

/// Errors that can abort `Service::initialize` or cause a tick to fail.
///
/// An oversized cursor shape is deliberately not a variant here: it is
/// non-fatal, so the cursor pipe only logs and reports it as a bool,
/// never as a `ServiceError`.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to map shared memory region: {0}")]
    Map(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("shared memory layout rejected: {0}")]
    Size(#[from] LayoutError),

    #[error("capture failed twice in a row with no recoverable outcome")]
    Retries,

    #[error("capture backend reinitialize failed: {0}")]
    Reinit(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("capture backend error: {0}")]
    Capture(#[source] Box<dyn std::error::Error + Send + Sync>),
}
