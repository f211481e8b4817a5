//! Checks of the DPC and DPL blobs, including a dry run of the fixups the boot applies to them.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::{
    validation_kind::{FixupValidationKind, ImageKind, ImageValidationKind, ValidationKind},
    validation_report::ValidationReport,
    validator::Validator,
};
use dpaa2_mc::{
    error::status_name,
    fdt::Fdt,
    fit,
    mc::{
        fixup::{fixup_dpc, fixup_dpl},
        GeneratedMacAddress,
    },
    PlatformConfig,
};

use super::{validate_flash_size, ValidationResult};

/// Validates one DPC or DPL blob against the platform configuration.
pub struct DeviceTreeValidator<'a> {
    config: &'a PlatformConfig,
    kind: ImageKind,
    image: &'a [u8],
    mac: GeneratedMacAddress,
}

impl<'a> DeviceTreeValidator<'a> {
    pub fn new(config: &'a PlatformConfig, kind: ImageKind, image: &'a [u8]) -> Self {
        DeviceTreeValidator { config, kind, image, mac: GeneratedMacAddress::new(config.mac_seed) }
    }

    /// Parses the blob, unwrapping the matching sub-image when it is a FIT.
    fn load(&self) -> Result<Fdt, ValidationKind> {
        let malformed = |reason: String| {
            ValidationKind::Image(ImageValidationKind::MalformedImage { image: self.kind, reason })
        };

        let tree = Fdt::from_bytes(self.image).map_err(|err| malformed(err.to_string()))?;
        if !fit::is_fit(&tree) {
            return Ok(tree);
        }
        log::debug!("{} is a FIT, using sub-image {}", self.kind, self.kind.fit_name());
        let data = fit::image_data(&tree, self.kind.fit_name()).map_err(|err| malformed(err.to_string()))?;
        Fdt::from_bytes(&data).map_err(|err| malformed(err.to_string()))
    }

    /// Path of the node the fixup writes the MAC address of `dpmac_id` into.
    fn port_path(&self, dpmac_id: u32) -> String {
        match self.kind {
            ImageKind::Dpc => format!("/board_info/ports/mac@{}", dpmac_id),
            _ => format!("/objects/dpmac@{}", dpmac_id),
        }
    }

    pub(super) fn validate_ports(&self, tree: &Fdt) -> ValidationResult {
        let mut validation_report = ValidationReport::new();

        for &dpmac_id in &self.config.active_dpmacs {
            if tree.node(&self.port_path(dpmac_id)).is_none() {
                validation_report
                    .add_violation(ValidationKind::Fixup(FixupValidationKind::MissingPortNode { image: self.kind, dpmac_id }));
            }
        }

        Ok(validation_report)
    }

    /// Applies the boot-time fixup to `tree` and returns the blob the boot would place in DRAM.
    fn fix_up(&self, mut tree: Fdt) -> Result<Vec<u8>, ValidationKind> {
        let mac_for = |dpmac_id: u32| self.mac.generate(dpmac_id);
        let result = match self.kind {
            ImageKind::Dpc => fixup_dpc(&mut tree, self.config, &mac_for),
            _ => fixup_dpl(&mut tree, self.config, &mac_for),
        };
        result.map_err(|status| {
            ValidationKind::Fixup(FixupValidationKind::FixupFailed {
                image: self.kind,
                reason: format!("fixup failed: {}", status_name(status)),
            })
        })?;

        let bytes = tree.to_bytes();
        let max_length = self.kind.flash(self.config).max_length;
        if bytes.len() as u64 > max_length {
            return Err(ValidationKind::Fixup(FixupValidationKind::FixedUpImageTooLarge {
                image: self.kind,
                size: bytes.len() as u64,
                max_length,
            }));
        }
        Ok(bytes)
    }

    /// The fixed-up blob, or the first violation that prevents producing it.
    pub fn fixed_up_image(&self) -> Result<Vec<u8>, ValidationKind> {
        self.fix_up(self.load()?)
    }
}

impl Validator for DeviceTreeValidator<'_> {
    fn validate(&self) -> ValidationResult {
        let mut validation_report = ValidationReport::new();
        validation_report.append_report(validate_flash_size(self.config, self.kind, self.image)?);

        let tree = match self.load() {
            Ok(tree) => tree,
            Err(violation) => {
                validation_report.add_violation(violation);
                return Ok(validation_report);
            }
        };
        validation_report.append_report(self.validate_ports(&tree)?);

        match self.fix_up(tree) {
            Ok(bytes) => log::info!("fixed-up {} is {} bytes", self.kind, bytes.len()),
            Err(violation) => validation_report.add_violation(violation),
        }
        Ok(validation_report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpaa2_mc::sim;

    fn config(ports: &[u32]) -> PlatformConfig {
        PlatformConfig { active_dpmacs: ports.to_vec(), mac_seed: 0x5eed, ..PlatformConfig::default() }
    }

    #[test]
    fn test_valid_dpc_is_fixed_up() {
        let config = config(&[1, 2]);
        let dpc = sim::dpc_blob();
        let validator = DeviceTreeValidator::new(&config, ImageKind::Dpc, &dpc);
        assert_eq!(validator.validate().unwrap().violation_count(), 0);

        let fixed = Fdt::from_bytes(&validator.fixed_up_image().unwrap()).unwrap();
        let port = fixed.node("/board_info/ports/mac@2").unwrap();
        let expected = GeneratedMacAddress::new(0x5eed).generate(2);
        assert_eq!(port.property("port_mac_address"), Some(&expected[..]));
        let pool = fixed.node("/resources/icid_pools/icid_pool@0").unwrap();
        assert_eq!(pool.property_u32("base_icid"), Some(config.icid_base));
        assert_eq!(fixed.node("/mc_general/log").unwrap().property_str("mode"), Some("LOG_MODE_ON"));
    }

    #[test]
    fn test_dpc_without_log_node_fails_fixup() {
        let mut dpc = Fdt::default();
        dpc.root.subnode_or_insert("resources");
        let dpc = dpc.to_bytes();

        let config = config(&[]);
        let validator = DeviceTreeValidator::new(&config, ImageKind::Dpc, &dpc);
        let validation_report = validator.validate().unwrap();
        assert_eq!(validation_report.violations("FixupFailed").len(), 1);
        assert!(matches!(
            validator.fixed_up_image(),
            Err(ValidationKind::Fixup(FixupValidationKind::FixupFailed { image: ImageKind::Dpc, .. }))
        ));
    }

    #[test]
    fn test_missing_port_nodes() {
        let config = config(&[4, 7]);
        let dpl = sim::dpl_blob();
        let validation_report = DeviceTreeValidator::new(&config, ImageKind::Dpl, &dpl).validate().unwrap();
        assert_eq!(
            validation_report.violations("MissingPortNode"),
            &[ValidationKind::Fixup(FixupValidationKind::MissingPortNode { image: ImageKind::Dpl, dpmac_id: 7 })]
        );
        assert_eq!(validation_report.violation_count(), 1);
    }

    #[test]
    fn test_fit_wrapped_dpl() {
        let config = config(&[1]);
        let dpl = fit::build_fit(&[("dpl", &sim::dpl_blob())]);
        let validator = DeviceTreeValidator::new(&config, ImageKind::Dpl, &dpl);
        assert_eq!(validator.validate().unwrap().violation_count(), 0);

        let fixed = Fdt::from_bytes(&validator.fixed_up_image().unwrap()).unwrap();
        assert!(fixed.node("/objects/dpmac@1").unwrap().property("mac_addr").is_some());

        let wrong_name = fit::build_fit(&[("dpc", &sim::dpl_blob())]);
        let validation_report = DeviceTreeValidator::new(&config, ImageKind::Dpl, &wrong_name).validate().unwrap();
        assert_eq!(validation_report.violations("MalformedImage").len(), 1);
    }

    #[test]
    fn test_fixups_must_fit_the_dram_slot() {
        let dpc = sim::dpc_blob();
        let mut config = config(&[]);
        config.dpc_image.max_length = dpc.len() as u64;

        let validation_report = DeviceTreeValidator::new(&config, ImageKind::Dpc, &dpc).validate().unwrap();
        assert!(validation_report.violations("ImageTooLarge").is_empty());
        let violations = validation_report.violations("FixedUpImageTooLarge");
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            violations[0],
            ValidationKind::Fixup(FixupValidationKind::FixedUpImageTooLarge { max_length, size, .. })
                if max_length == dpc.len() as u64 && size > max_length
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let config = config(&[]);
        let validation_report =
            DeviceTreeValidator::new(&config, ImageKind::Dpc, b"not a device tree blob at all, padding to header")
                .validate()
                .unwrap();
        assert_eq!(validation_report.violations("MalformedImage").len(), 1);
        assert_eq!(validation_report.violation_count(), 1);
    }
}
