//! Enumerations and helpers describing the checks run against an MC image set and their
//! violations.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use std::fmt;

use dpaa2_mc::{config::FlashImage, PlatformConfig};
use serde::Serialize;

/// The three images the MC boot consumes from flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ImageKind {
    Firmware,
    Dpc,
    Dpl,
}

impl ImageKind {
    /// Name of the sub-image when the blob is a FIT container.
    pub fn fit_name(&self) -> &'static str {
        match self {
            ImageKind::Firmware => "firmware",
            ImageKind::Dpc => "dpc",
            ImageKind::Dpl => "dpl",
        }
    }

    pub fn flash<'a>(&self, config: &'a PlatformConfig) -> &'a FlashImage {
        match self {
            ImageKind::Firmware => &config.firmware_image,
            ImageKind::Dpc => &config.dpc_image,
            ImageKind::Dpl => &config.dpl_image,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Firmware => write!(f, "MC firmware"),
            ImageKind::Dpc => write!(f, "DPC"),
            ImageKind::Dpl => write!(f, "DPL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ImageValidationKind {
    // Images must fit the flash region reserved for them
    ImageTooLarge { image: ImageKind, size: u64, max_length: u64 },

    // Images must be FDT blobs, or FIT containers holding the expected sub-image
    MalformedImage { image: ImageKind, reason: String },

    // The firmware is copied to the start of private DRAM and must end before the first blob
    FirmwareOverlapsBlobs { size: u64, limit: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LayoutValidationKind {
    // Private DRAM must be 1 to 16 blocks of 256 MiB, 256 MiB aligned
    InvalidPrivateMemory { size: u64, alignment: u64 },

    // DPC, DPL and log header must lie inside private DRAM
    RegionOutsidePrivateDram { region: &'static str, offset: u64, length: u64, dram_size: u64 },

    // DPC, DPL and log header must not overlap
    OverlappingRegions { first: &'static str, second: &'static str },

    // Ports brought up by the driver must have their MAC address fixed up
    PortWithoutFixup { dpmac_id: u32, dpmac_count: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FixupValidationKind {
    // The DPC must have the nodes the boot fixups rewrite
    FixupFailed { image: ImageKind, reason: String },

    // Every active port must be described by the DPC and the DPL
    MissingPortNode { image: ImageKind, dpmac_id: u32 },

    // The fixed-up blob must still fit its slot in private DRAM
    FixedUpImageTooLarge { image: ImageKind, size: u64, max_length: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ValidationKind {
    Image(ImageValidationKind),
    Layout(LayoutValidationKind),
    Fixup(FixupValidationKind),
}

impl ValidationKind {
    pub fn header(&self) -> &str {
        match self {
            ValidationKind::Image(image) => match image {
                ImageValidationKind::ImageTooLarge { .. } => "Image: Exceeds Flash Region",
                ImageValidationKind::MalformedImage { .. } => "Image: Malformed Image",
                ImageValidationKind::FirmwareOverlapsBlobs { .. } => "Image: Firmware Overlaps DPC/DPL",
            },
            ValidationKind::Layout(layout) => match layout {
                LayoutValidationKind::InvalidPrivateMemory { .. } => "Layout: Invalid Private DRAM",
                LayoutValidationKind::RegionOutsidePrivateDram { .. } => "Layout: Region Outside Private DRAM",
                LayoutValidationKind::OverlappingRegions { .. } => "Layout: Overlapping Regions",
                LayoutValidationKind::PortWithoutFixup { .. } => "Layout: Active Port Without MAC Fixup",
            },
            ValidationKind::Fixup(fixup) => match fixup {
                FixupValidationKind::FixupFailed { .. } => "Fixup: DPC Fixup Failed",
                FixupValidationKind::MissingPortNode { .. } => "Fixup: Missing Port Node",
                FixupValidationKind::FixedUpImageTooLarge { .. } => "Fixup: Fixed-Up Image Too Large",
            },
        }
    }

    pub fn guidance(&self) -> &str {
        match self {
            ValidationKind::Image(image) => match image {
                ImageValidationKind::ImageTooLarge { .. } => "   The boot reads each image's FDT total size from flash and refuses images larger\n   \
                                                             than the configured max_length. Shrink the image or enlarge its flash region.",
                ImageValidationKind::MalformedImage { .. } => "   The MC firmware must be a FIT with a crc32-verified `firmware` sub-image.\n   \
                                                              The DPC and DPL must be FDT blobs, or FITs with a `dpc` / `dpl` sub-image.",
                ImageValidationKind::FirmwareOverlapsBlobs { .. } => "   The firmware payload is copied to offset 0 of private DRAM. Move dpc_dram_offset,\n   \
                                                                     dpl_dram_offset and log_header_offset past its end.",
            },
            ValidationKind::Layout(layout) => match layout {
                LayoutValidationKind::InvalidPrivateMemory { .. } => "   The MC accepts 1 to 16 contiguous blocks of 256 MiB. Static regions must start\n   \
                                                                     on a 256 MiB boundary and allocated regions must request that alignment.",
                LayoutValidationKind::RegionOutsidePrivateDram { .. } => "   Offsets are relative to the private DRAM base. Each region plus its length\n   \
                                                                         must not exceed the private DRAM size.",
                LayoutValidationKind::OverlappingRegions { .. } => "   The DPC and DPL slots are sized by their flash max_length. Space the DRAM\n   \
                                                                   offsets so no two regions share bytes.",
                LayoutValidationKind::PortWithoutFixup { .. } => "   Only DPMACs 1..=dpmac_count get a MAC address written into the DPC and DPL.\n   \
                                                                 Raise dpmac_count or remove the port from active_dpmacs.",
            },
            ValidationKind::Fixup(fixup) => match fixup {
                FixupValidationKind::FixupFailed { .. } => "   The DPC must contain /resources and /mc_general/log. The boot rewrites the ICID\n   \
                                                           pool and log settings there and fails without them.",
                FixupValidationKind::MissingPortNode { .. } => "   Add /board_info/ports/mac@N to the DPC and /objects/dpmac@N to the DPL for every\n   \
                                                               active port, otherwise the port keeps the MAC address baked into the image.",
                FixupValidationKind::FixedUpImageTooLarge { .. } => "   Fixups add properties. Leave headroom between the raw image size and\n   \
                                                                    the configured max_length.",
            },
        }
    }

    pub fn name(&self) -> String {
        match self {
            ValidationKind::Image(image) => match image {
                ImageValidationKind::ImageTooLarge { .. } => "ImageTooLarge".to_string(),
                ImageValidationKind::MalformedImage { .. } => "MalformedImage".to_string(),
                ImageValidationKind::FirmwareOverlapsBlobs { .. } => "FirmwareOverlapsBlobs".to_string(),
            },
            ValidationKind::Layout(layout) => match layout {
                LayoutValidationKind::InvalidPrivateMemory { .. } => "InvalidPrivateMemory".to_string(),
                LayoutValidationKind::RegionOutsidePrivateDram { .. } => "RegionOutsidePrivateDram".to_string(),
                LayoutValidationKind::OverlappingRegions { .. } => "OverlappingRegions".to_string(),
                LayoutValidationKind::PortWithoutFixup { .. } => "PortWithoutFixup".to_string(),
            },
            ValidationKind::Fixup(fixup) => match fixup {
                FixupValidationKind::FixupFailed { .. } => "FixupFailed".to_string(),
                FixupValidationKind::MissingPortNode { .. } => "MissingPortNode".to_string(),
                FixupValidationKind::FixedUpImageTooLarge { .. } => "FixedUpImageTooLarge".to_string(),
            },
        }
    }
}

pub trait PrettyPrintTable {
    fn table_header(&self) -> Vec<&str>;
    fn table_row(&self, row_num: String) -> Vec<String>;
}

impl PrettyPrintTable for ValidationKind {
    fn table_header(&self) -> Vec<&str> {
        match self {
            ValidationKind::Image(_) => vec!["#", "Image", "Violation/Resolution"],
            ValidationKind::Layout(layout) => match layout {
                LayoutValidationKind::PortWithoutFixup { .. } => vec!["#", "Port", "Violation/Resolution"],
                _ => vec!["#", "Private DRAM", "Violation/Resolution"],
            },
            ValidationKind::Fixup(_) => vec!["#", "Image", "Violation/Resolution"],
        }
    }

    fn table_row(&self, row_num: String) -> Vec<String> {
        match self {
            ValidationKind::Image(image) => match image {
                ImageValidationKind::ImageTooLarge { image, size, max_length } => {
                    let resolution = format!("Image is {} bytes\nFlash region allows {} bytes", size, max_length);
                    vec![row_num, image.to_string(), resolution]
                }
                ImageValidationKind::MalformedImage { image, reason } => {
                    vec![row_num, image.to_string(), reason.clone()]
                }
                ImageValidationKind::FirmwareOverlapsBlobs { size, limit } => {
                    let resolution = format!("Firmware payload is {:#x} bytes\nFirst blob starts at {:#x}", size, limit);
                    vec![row_num, ImageKind::Firmware.to_string(), resolution]
                }
            },
            ValidationKind::Layout(layout) => match layout {
                LayoutValidationKind::InvalidPrivateMemory { size, alignment } => {
                    let column = format!("size {:#x}\nalignment {:#x}", size, alignment);
                    let resolution = "Size should be a multiple of 256 MiB, at most 4 GiB,\nwith 256 MiB alignment".to_string();
                    vec![row_num, column, resolution]
                }
                LayoutValidationKind::RegionOutsidePrivateDram { region, offset, length, dram_size } => {
                    let column = format!("{}\n[{:#x}, {:#x})", region, offset, offset + length);
                    let resolution = format!("Region should end within the {:#x} byte private DRAM", dram_size);
                    vec![row_num, column, resolution]
                }
                LayoutValidationKind::OverlappingRegions { first, second } => {
                    let column = format!("{}\n{}", first, second);
                    let resolution = format!("{} should not overlap with {}", first, second);
                    vec![row_num, column, resolution]
                }
                LayoutValidationKind::PortWithoutFixup { dpmac_id, dpmac_count } => {
                    let resolution = format!("dpmac@{} is active but only 1..={} are fixed up", dpmac_id, dpmac_count);
                    vec![row_num, format!("dpmac@{}", dpmac_id), resolution]
                }
            },
            ValidationKind::Fixup(fixup) => match fixup {
                FixupValidationKind::FixupFailed { image, reason } => vec![row_num, image.to_string(), reason.clone()],
                FixupValidationKind::MissingPortNode { image, dpmac_id } => {
                    let node = match image {
                        ImageKind::Dpc => format!("/board_info/ports/mac@{}", dpmac_id),
                        _ => format!("/objects/dpmac@{}", dpmac_id),
                    };
                    vec![row_num, image.to_string(), format!("{} should exist", node)]
                }
                FixupValidationKind::FixedUpImageTooLarge { image, size, max_length } => {
                    let resolution = format!("Fixed-up image is {} bytes\nDRAM slot allows {} bytes", size, max_length);
                    vec![row_num, image.to_string(), resolution]
                }
            },
        }
    }
}
