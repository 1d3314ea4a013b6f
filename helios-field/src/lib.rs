// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

pub mod probe;
pub mod stepper;
pub mod volume;
pub mod wavefront;

pub use stepper::{FreePropagation, ProbeIllumination, SignConvention, SliceStepper, StepperConfig};
pub use volume::{ObjectBatch, ObjectRepr, ObjectVolume};
pub use wavefront::{Wavefront, WavefrontBatch};
