//! Errors that stop the validation tool.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use std::fmt;

/// Represents possible errors that can occur during the validation app's
/// execution.
#[derive(Debug, PartialEq)]
pub enum ValidationAppError {
    /// Indicates that the command-line arguments are invalid. The `String`
    /// contains the missing or incorrect argument.
    InvalidCommandLine(String),

    /// Indicates that an input file could not be found or read. The `String`
    /// contains the path that failed to be read.
    FileNotFound(String),

    /// Indicates a failure in serializing or deserializing JSON. The `String`
    /// contains the reason.
    JSONSerializationFailed(String),

    /// Indicates that an output file could not be written. The `String`
    /// contains the path.
    WriteFailed(String),

    /// Indicates that one or more validation rules were violated. The `u32` is
    /// the number of violations detected.
    ValidationErrors(u32),
}

impl fmt::Display for ValidationAppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationAppError::InvalidCommandLine(argument) => {
                write!(f, "Invalid command line argument: {}", argument)
            }
            ValidationAppError::FileNotFound(path) => {
                write!(f, "File not found: {}", path)
            }
            ValidationAppError::JSONSerializationFailed(reason) => {
                write!(f, "Failed to serialize/deserialize JSON: {}", reason)
            }
            ValidationAppError::WriteFailed(path) => {
                write!(f, "Failed to write {}", path)
            }
            ValidationAppError::ValidationErrors(violations) => {
                write!(f, "Found {} validation errors", violations)
            }
        }
    }
}
