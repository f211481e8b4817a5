//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::validate::ValidationResult;

/// A trait representing a generic validator that performs checks and returns
/// validation results.
///
/// Types implementing this trait run one family of checks over the image set
/// and return the outcome as a [`ValidationResult`] object.
pub trait Validator {
    /// Executes the validation logic and returns a [`ValidationResult`] object.
    fn validate(&self) -> ValidationResult;
}
