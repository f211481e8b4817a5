//! Runs every validator over an MC image set and reports the result.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
mod device_tree;
mod firmware;
mod layout;

use std::{fs, path::Path};

use dpaa2_mc::PlatformConfig;

use crate::{
    commandline::CommandLine,
    errors::ValidationAppError,
    validation_kind::{ImageKind, ImageValidationKind, ValidationKind},
    validation_report::ValidationReport,
    validator::Validator,
};
use device_tree::DeviceTreeValidator;
use firmware::FirmwareValidator;
use layout::LayoutValidator;

pub type ValidationResult = Result<ValidationReport, ValidationAppError>;

/// Raw image bytes as read from disk. Absent images are not checked.
#[derive(Debug, Default)]
pub struct ImageSet {
    pub firmware: Option<Vec<u8>>,
    pub dpc: Option<Vec<u8>>,
    pub dpl: Option<Vec<u8>>,
}

impl ImageSet {
    fn is_empty(&self) -> bool {
        self.firmware.is_none() && self.dpc.is_none() && self.dpl.is_none()
    }

    fn device_trees(&self) -> impl Iterator<Item = (ImageKind, &[u8])> {
        [(ImageKind::Dpc, &self.dpc), (ImageKind::Dpl, &self.dpl)]
            .into_iter()
            .filter_map(|(kind, image)| image.as_deref().map(|image| (kind, image)))
    }
}

/// Flags `image` when it is larger than its flash region.
pub(crate) fn validate_flash_size(config: &PlatformConfig, kind: ImageKind, image: &[u8]) -> ValidationResult {
    let mut validation_report = ValidationReport::new();
    let max_length = kind.flash(config).max_length;
    if image.len() as u64 > max_length {
        validation_report.add_violation(ValidationKind::Image(ImageValidationKind::ImageTooLarge {
            image: kind,
            size: image.len() as u64,
            max_length,
        }));
    }
    Ok(validation_report)
}

/// Runs the layout checks and the checks of every image present in `images`.
pub fn validate_images(config: &PlatformConfig, images: &ImageSet) -> ValidationResult {
    if images.is_empty() {
        return Err(ValidationAppError::InvalidCommandLine(
            "no image given, pass at least one of --firmware, --dpc or --dpl".to_string(),
        ));
    }

    let mut validation_report = LayoutValidator::new(config).validate()?;
    if let Some(firmware) = &images.firmware {
        validation_report.append_report(FirmwareValidator::new(config, firmware).validate()?);
    }
    for (kind, image) in images.device_trees() {
        validation_report.append_report(DeviceTreeValidator::new(config, kind, image).validate()?);
    }
    Ok(validation_report)
}

/// Writes the fixed-up DPC and DPL present in `images` to `out_dir`, returning the written paths.
pub fn write_fixed_up_images(
    config: &PlatformConfig,
    images: &ImageSet,
    out_dir: &Path,
) -> Result<Vec<String>, ValidationAppError> {
    fs::create_dir_all(out_dir).map_err(|_| ValidationAppError::WriteFailed(out_dir.display().to_string()))?;

    let mut written = Vec::new();
    for (kind, image) in images.device_trees() {
        let Ok(bytes) = DeviceTreeValidator::new(config, kind, image).fixed_up_image() else {
            log::warn!("{} cannot be fixed up, not written", kind);
            continue;
        };
        let path = out_dir.join(format!("{}.dtb", kind.fit_name()));
        fs::write(&path, &bytes).map_err(|_| ValidationAppError::WriteFailed(path.display().to_string()))?;
        log::info!("wrote fixed-up {} to {}", kind, path.display());
        written.push(path.display().to_string());
    }
    Ok(written)
}

pub struct ValidationApp {
    args: CommandLine,
}

impl ValidationApp {
    pub fn new(args: CommandLine) -> Self {
        ValidationApp { args }
    }

    fn load_config(&self) -> Result<PlatformConfig, ValidationAppError> {
        let Some(path) = &self.args.config else {
            log::info!("no platform configuration given, using defaults");
            return Ok(PlatformConfig::default());
        };
        let Ok(content) = fs::read_to_string(path) else {
            return Err(ValidationAppError::FileNotFound(path.clone()));
        };
        serde_json::from_str(&content)
            .map_err(|err| ValidationAppError::JSONSerializationFailed(format!("{}: {}", path, err)))
    }

    fn load_images(&self) -> Result<ImageSet, ValidationAppError> {
        let read = |path: &Option<String>| -> Result<Option<Vec<u8>>, ValidationAppError> {
            match path {
                Some(path) => fs::read(path).map(Some).map_err(|_| ValidationAppError::FileNotFound(path.clone())),
                None => Ok(None),
            }
        };
        Ok(ImageSet { firmware: read(&self.args.firmware)?, dpc: read(&self.args.dpc)?, dpl: read(&self.args.dpl)? })
    }

    pub fn run(&self) -> Result<(), ValidationAppError> {
        let config = self.load_config()?;
        let images = self.load_images()?;
        let validation_report = validate_images(&config, &images)?;

        if self.args.json {
            let json = validation_report
                .to_json()
                .map_err(|err| ValidationAppError::JSONSerializationFailed(err.to_string()))?;
            println!("{}", json);
        } else {
            validation_report.show_results();
        }

        let violations = validation_report.violation_count();
        if let Some(out_dir) = &self.args.out_dir {
            if violations == 0 {
                write_fixed_up_images(&config, &images, Path::new(out_dir))?;
            } else {
                log::warn!("not writing fixed-up images, {} violations found", violations);
            }
        }

        match violations {
            0 => Ok(()),
            count => Err(ValidationAppError::ValidationErrors(count as u32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpaa2_mc::{fdt::Fdt, fit, sim};

    fn full_set() -> ImageSet {
        ImageSet {
            firmware: Some(fit::build_fit(&[("firmware", sim::FIRMWARE_PAYLOAD)])),
            dpc: Some(sim::dpc_blob()),
            dpl: Some(sim::dpl_blob()),
        }
    }

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dpaa2_image_validator_{}_{}", name, std::process::id()))
    }

    #[test]
    fn test_validate_images() {
        let config = PlatformConfig { active_dpmacs: vec![1, 2, 3, 4], ..PlatformConfig::default() };
        let validation_report = validate_images(&config, &full_set()).unwrap();
        assert_eq!(validation_report.violation_count(), 0);

        let config = PlatformConfig { active_dpmacs: vec![5], ..PlatformConfig::default() };
        let validation_report = validate_images(&config, &full_set()).unwrap();
        assert_eq!(validation_report.violations("MissingPortNode").len(), 2);
    }

    #[test]
    fn test_validate_images_needs_an_image() {
        let result = validate_images(&PlatformConfig::default(), &ImageSet::default());
        assert!(matches!(result, Err(ValidationAppError::InvalidCommandLine(_))));
    }

    #[test]
    fn test_write_fixed_up_images() {
        let out_dir = scratch_dir("write");
        let config = PlatformConfig { active_dpmacs: vec![1], ..PlatformConfig::default() };
        let written = write_fixed_up_images(&config, &full_set(), &out_dir).unwrap();
        assert_eq!(written.len(), 2);

        let dpl = Fdt::from_bytes(&fs::read(out_dir.join("dpl.dtb")).unwrap()).unwrap();
        assert!(dpl.node("/objects/dpmac@1").unwrap().property("mac_addr").is_some());
        let dpc = Fdt::from_bytes(&fs::read(out_dir.join("dpc.dtb")).unwrap()).unwrap();
        assert!(dpc.node("/board_info/ports/mac@1").unwrap().property("port_mac_address").is_some());

        fs::remove_dir_all(&out_dir).unwrap();
    }

    #[test]
    fn test_app_reports_violations() {
        let dir = scratch_dir("app");
        fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.json");
        let config = PlatformConfig { active_dpmacs: vec![9], ..PlatformConfig::default() };
        fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();
        let dpl_path = dir.join("dpl.dtb");
        fs::write(&dpl_path, sim::dpl_blob()).unwrap();

        let app = ValidationApp::new(CommandLine {
            config: Some(config_path.display().to_string()),
            dpl: Some(dpl_path.display().to_string()),
            json: true,
            ..CommandLine::default()
        });
        assert_eq!(app.run(), Err(ValidationAppError::ValidationErrors(1)));

        let app = ValidationApp::new(CommandLine {
            dpc: Some(dir.join("missing.dtb").display().to_string()),
            ..CommandLine::default()
        });
        assert!(matches!(app.run(), Err(ValidationAppError::FileNotFound(_))));

        fs::remove_dir_all(&dir).unwrap();
    }
}
