//! Checks of the MC firmware FIT image.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::{
    validation_kind::{ImageKind, ImageValidationKind, ValidationKind},
    validation_report::ValidationReport,
    validator::Validator,
};
use dpaa2_mc::{fit, PlatformConfig};

use super::{layout::blob_regions, validate_flash_size, ValidationResult};

pub struct FirmwareValidator<'a> {
    config: &'a PlatformConfig,
    image: &'a [u8],
}

impl<'a> FirmwareValidator<'a> {
    pub fn new(config: &'a PlatformConfig, image: &'a [u8]) -> Self {
        FirmwareValidator { config, image }
    }

    /// Extracts the `firmware` sub-image, verifying its hashes, and checks that the payload ends
    /// before the first region the boot writes behind it.
    pub(super) fn validate_payload(&self) -> ValidationResult {
        let mut validation_report = ValidationReport::new();

        let payload = match fit::extract_image(self.image, ImageKind::Firmware.fit_name()) {
            Ok(payload) => payload,
            Err(err) => {
                validation_report.add_violation(ValidationKind::Image(ImageValidationKind::MalformedImage {
                    image: ImageKind::Firmware,
                    reason: err.to_string(),
                }));
                return Ok(validation_report);
            }
        };
        log::info!("MC firmware payload is {} bytes", payload.len());

        let limit = blob_regions(self.config).iter().map(|region| region.offset).min().unwrap_or(u64::MAX);
        if payload.len() as u64 > limit {
            validation_report.add_violation(ValidationKind::Image(ImageValidationKind::FirmwareOverlapsBlobs {
                size: payload.len() as u64,
                limit,
            }));
        }

        Ok(validation_report)
    }
}

impl Validator for FirmwareValidator<'_> {
    fn validate(&self) -> ValidationResult {
        let mut validation_report = ValidationReport::new();
        validation_report.append_report(validate_flash_size(self.config, ImageKind::Firmware, self.image)?);
        validation_report.append_report(self.validate_payload()?);
        Ok(validation_report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpaa2_mc::sim;

    #[test]
    fn test_valid_firmware() {
        let config = PlatformConfig::default();
        let image = fit::build_fit(&[("firmware", sim::FIRMWARE_PAYLOAD)]);
        let validation_report = FirmwareValidator::new(&config, &image).validate().unwrap();
        assert_eq!(validation_report.violation_count(), 0);
    }

    #[test]
    fn test_malformed_firmware() {
        let config = PlatformConfig::default();

        let image = fit::build_fit(&[("kernel", sim::FIRMWARE_PAYLOAD)]);
        let validation_report = FirmwareValidator::new(&config, &image).validate().unwrap();
        assert_eq!(validation_report.violations("MalformedImage").len(), 1);

        let validation_report = FirmwareValidator::new(&config, sim::FIRMWARE_PAYLOAD).validate().unwrap();
        assert_eq!(validation_report.violations("MalformedImage").len(), 1);

        let mut image = fit::build_fit(&[("firmware", sim::FIRMWARE_PAYLOAD)]);
        let at = image.windows(4).position(|w| w == b"MCFW").unwrap();
        image[at] = b'X';
        let validation_report = FirmwareValidator::new(&config, &image).validate().unwrap();
        let violations = validation_report.violations("MalformedImage");
        assert_eq!(violations.len(), 1);
        let ValidationKind::Image(ImageValidationKind::MalformedImage { reason, .. }) = &violations[0] else {
            panic!("unexpected violation {:?}", violations[0]);
        };
        assert!(reason.contains("crc32 mismatch"));
    }

    #[test]
    fn test_firmware_size_limits() {
        let image = fit::build_fit(&[("firmware", sim::FIRMWARE_PAYLOAD)]);

        let mut config = PlatformConfig::default();
        config.firmware_image.max_length = 64;
        let validation_report = FirmwareValidator::new(&config, &image).validate().unwrap();
        assert_eq!(validation_report.violations("ImageTooLarge").len(), 1);
        assert_eq!(validation_report.violation_count(), 1);

        let config = PlatformConfig { dpc_dram_offset: 0x10, ..PlatformConfig::default() };
        let validation_report = FirmwareValidator::new(&config, &image).validate().unwrap();
        assert_eq!(
            validation_report.violations("FirmwareOverlapsBlobs"),
            &[ValidationKind::Image(ImageValidationKind::FirmwareOverlapsBlobs {
                size: sim::FIRMWARE_PAYLOAD.len() as u64,
                limit: 0x10,
            })]
        );
    }
}
