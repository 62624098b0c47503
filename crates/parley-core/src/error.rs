// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Top-level error type for starting the service.
//!
//! [`TemplateSettings::connect_pipeline`](crate::config::TemplateSettings::connect_pipeline)
//! returns it; the binary wraps it in `anyhow`.

use thiserror::Error;

use crate::adapters::AdapterError;
use crate::config::ConfigError;
use crate::message::schema::SchemaLoadError;
use crate::pipeline::PipelineError;
use crate::transport::TransportError;

/// Result type using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Schema(#[from] SchemaLoadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
