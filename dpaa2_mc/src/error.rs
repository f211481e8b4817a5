//! Result type shared by every driver operation.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use r_efi::efi;

/// Public result type for the crate. Errors are UEFI status codes; `SUCCESS` is never used as an
/// error value.
pub type Result<T> = core::result::Result<T, efi::Status>;

/// Short human readable name of the status codes this crate produces, for log lines.
pub fn status_name(status: efi::Status) -> &'static str {
    match status {
        efi::Status::SUCCESS => "Success",
        efi::Status::TIMEOUT => "Timeout",
        efi::Status::DEVICE_ERROR => "Device Error",
        efi::Status::OUT_OF_RESOURCES => "Out of Resources",
        efi::Status::INVALID_PARAMETER => "Invalid Parameter",
        efi::Status::NOT_READY => "Not Ready",
        efi::Status::NOT_FOUND => "Not Found",
        efi::Status::BUFFER_TOO_SMALL => "Buffer Too Small",
        efi::Status::NOT_STARTED => "Not Started",
        efi::Status::ALREADY_STARTED => "Already Started",
        efi::Status::UNSUPPORTED => "Unsupported",
        efi::Status::CRC_ERROR => "CRC Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(status_name(efi::Status::TIMEOUT), "Timeout");
        assert_eq!(status_name(efi::Status::DEVICE_ERROR), "Device Error");
        assert_eq!(status_name(efi::Status::ABORTED), "Unknown");
    }
}
