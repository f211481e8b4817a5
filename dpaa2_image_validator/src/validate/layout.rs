//! Checks of the private DRAM layout described by the platform configuration.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::{
    validation_kind::{LayoutValidationKind, ValidationKind},
    validation_report::ValidationReport,
    validator::Validator,
};
use dpaa2_mc::{
    config::PrivateMemoryConfig,
    mc::{boot::check_private_memory, log::MC_LOG_HEADER_SIZE},
    PlatformConfig,
};

use super::ValidationResult;

/// A named byte range inside private DRAM.
#[derive(Debug, Clone, Copy)]
pub(super) struct DramRegion {
    pub name: &'static str,
    pub offset: u64,
    pub length: u64,
}

impl DramRegion {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    fn overlaps(&self, other: &DramRegion) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Regions the boot writes after the firmware: the DPC and DPL slots and the MC log header.
pub(super) fn blob_regions(config: &PlatformConfig) -> [DramRegion; 3] {
    [
        DramRegion { name: "DPC", offset: config.dpc_dram_offset, length: config.dpc_image.max_length },
        DramRegion { name: "DPL", offset: config.dpl_dram_offset, length: config.dpl_image.max_length },
        DramRegion { name: "MC log header", offset: config.log_header_offset, length: MC_LOG_HEADER_SIZE },
    ]
}

pub struct LayoutValidator<'a> {
    config: &'a PlatformConfig,
}

impl<'a> LayoutValidator<'a> {
    pub fn new(config: &'a PlatformConfig) -> Self {
        LayoutValidator { config }
    }

    pub(super) fn validate_private_memory(&self) -> ValidationResult {
        let mut validation_report = ValidationReport::new();

        if check_private_memory(&self.config.private_memory).is_err() {
            let alignment = match self.config.private_memory {
                PrivateMemoryConfig::Allocate { alignment, .. } => alignment,
                PrivateMemoryConfig::Static { base, .. } => base,
            };
            validation_report.add_violation(ValidationKind::Layout(LayoutValidationKind::InvalidPrivateMemory {
                size: self.config.private_memory.size(),
                alignment,
            }));
        }

        Ok(validation_report)
    }

    /// Checks that every blob region fits in private DRAM and that no two regions overlap.
    pub(super) fn validate_regions(&self) -> ValidationResult {
        let mut validation_report = ValidationReport::new();
        let dram_size = self.config.private_memory.size();
        let regions = blob_regions(self.config);

        for region in &regions {
            if region.end() > dram_size {
                validation_report.add_violation(ValidationKind::Layout(
                    LayoutValidationKind::RegionOutsidePrivateDram {
                        region: region.name,
                        offset: region.offset,
                        length: region.length,
                        dram_size,
                    },
                ));
            }
        }

        for (i, first) in regions.iter().enumerate() {
            for second in &regions[i + 1..] {
                if first.overlaps(second) {
                    validation_report.add_violation(ValidationKind::Layout(LayoutValidationKind::OverlappingRegions {
                        first: first.name,
                        second: second.name,
                    }));
                }
            }
        }

        Ok(validation_report)
    }

    pub(super) fn validate_active_ports(&self) -> ValidationResult {
        let mut validation_report = ValidationReport::new();
        let dpmac_count = self.config.dpmac_count;

        for &dpmac_id in &self.config.active_dpmacs {
            if dpmac_id == 0 || dpmac_id > dpmac_count {
                validation_report
                    .add_violation(ValidationKind::Layout(LayoutValidationKind::PortWithoutFixup { dpmac_id, dpmac_count }));
            }
        }

        Ok(validation_report)
    }
}

impl Validator for LayoutValidator<'_> {
    fn validate(&self) -> ValidationResult {
        let mut validation_report = ValidationReport::new();
        validation_report.append_report(self.validate_private_memory()?);
        validation_report.append_report(self.validate_regions()?);
        validation_report.append_report(self.validate_active_ports()?);
        Ok(validation_report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE_256MB: u64 = 0x1000_0000;

    #[test]
    fn test_default_layout_is_valid() {
        let config = PlatformConfig { active_dpmacs: vec![3, 4], ..PlatformConfig::default() };
        let validation_report = LayoutValidator::new(&config).validate().unwrap();
        assert_eq!(validation_report.violation_count(), 0);
    }

    #[test]
    fn test_validate_private_memory() {
        let mut config = PlatformConfig {
            private_memory: PrivateMemoryConfig::Allocate { size: SIZE_256MB + 0x1000, alignment: SIZE_256MB },
            ..PlatformConfig::default()
        };
        let validation_report = LayoutValidator::new(&config).validate_private_memory().unwrap();
        assert_eq!(
            validation_report.violations("InvalidPrivateMemory"),
            &[ValidationKind::Layout(LayoutValidationKind::InvalidPrivateMemory {
                size: SIZE_256MB + 0x1000,
                alignment: SIZE_256MB,
            })]
        );

        config.private_memory = PrivateMemoryConfig::Static { base: 0x8000_1000, size: SIZE_256MB };
        let validation_report = LayoutValidator::new(&config).validate_private_memory().unwrap();
        assert_eq!(validation_report.violation_count(), 1);

        config.private_memory = PrivateMemoryConfig::Static { base: 0x8000_0000, size: 17 * SIZE_256MB };
        let validation_report = LayoutValidator::new(&config).validate_private_memory().unwrap();
        assert_eq!(validation_report.violation_count(), 1);

        config.private_memory = PrivateMemoryConfig::Static { base: 0x8000_0000, size: 2 * SIZE_256MB };
        let validation_report = LayoutValidator::new(&config).validate_private_memory().unwrap();
        assert_eq!(validation_report.violation_count(), 0);
    }

    #[test]
    fn test_validate_regions() {
        let config = PlatformConfig { dpl_dram_offset: 0x00F0_1000, ..PlatformConfig::default() };
        let validation_report = LayoutValidator::new(&config).validate_regions().unwrap();
        assert_eq!(
            validation_report.violations("OverlappingRegions"),
            &[ValidationKind::Layout(LayoutValidationKind::OverlappingRegions { first: "DPC", second: "DPL" })]
        );
        assert_eq!(validation_report.violation_count(), 1);

        let config = PlatformConfig { log_header_offset: 2 * SIZE_256MB - 8, ..PlatformConfig::default() };
        let validation_report = LayoutValidator::new(&config).validate_regions().unwrap();
        let violations = validation_report.violations("RegionOutsidePrivateDram");
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            &violations[0],
            ValidationKind::Layout(LayoutValidationKind::RegionOutsidePrivateDram { region: "MC log header", .. })
        ));
    }

    #[test]
    fn test_validate_active_ports() {
        let config = PlatformConfig { active_dpmacs: vec![0, 1, 16, 17], ..PlatformConfig::default() };
        let validation_report = LayoutValidator::new(&config).validate_active_ports().unwrap();
        assert_eq!(
            validation_report.violations("PortWithoutFixup"),
            &[
                ValidationKind::Layout(LayoutValidationKind::PortWithoutFixup { dpmac_id: 0, dpmac_count: 16 }),
                ValidationKind::Layout(LayoutValidationKind::PortWithoutFixup { dpmac_id: 17, dpmac_count: 16 }),
            ]
        );
    }
}
