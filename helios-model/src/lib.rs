// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

pub mod batch;
pub mod data;
pub mod loss;
pub mod models;
pub mod regularizer;

pub use data::{DiffractionData, InMemoryDiffraction};
pub use loss::{BeamstopMask, LossKind, RawDataType};
pub use models::{
    ForwardModel, ForwardVariant, LossArgs, ModelConfig, MultiDistGeometry, MultiDistModel,
    ObjectInput, PosCorrectionTable, PredictArgs, PtychographyModel, SparseGeometry,
    SparseMultisliceModel,
};
pub use regularizer::{Regularizer, RegularizerSet};

/// Errors surfaced to the reconstruction driver. Shape mismatches inside
/// the simulation itself are programming errors and assert; these are the
/// configuration- and integration-level failures the driver can see.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A configuration the models refuse to approximate silently.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The caller's positional argument list does not match the variant's
    /// declared order.
    #[error("loss-function argument order mismatch: expected {expected:?}, got {got:?}")]
    ArgumentOrder {
        expected: Vec<String>,
        got: Vec<String>,
    },

    /// A required numeric option was not supplied.
    #[error("missing hyperparameter `{0}`")]
    MissingHyperparameter(&'static str),

    /// Name lookup against the declared argument list failed.
    #[error("`{0}` is not in the argument list")]
    UnknownArgument(String),
}
