//! Flattened Image Tree (FIT) sub-image extraction.
//!
//! A FIT is an FDT whose `/images` node holds one subnode per payload. Each payload carries its
//! bytes in a `data` property and may carry `hash@N` subnodes naming an `algo` and the expected
//! `value`. Only `crc32` hashes are checked; other algorithms are logged and skipped.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::fmt;

use r_efi::efi;

use crate::{
    crc32::crc32,
    fdt::{Fdt, FdtError, Node},
};

const IMAGES_PATH: &str = "/images";

/// Errors raised while locating or verifying a FIT sub-image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FitError {
    /// The container is not a well-formed FDT.
    Fdt(FdtError),
    /// The tree has no `/images` node, so it is not a FIT.
    NotAFit,
    /// No sub-image with the requested name exists.
    ImageNotFound(String),
    /// The sub-image has no `data` property.
    MissingData(String),
    /// A `crc32` hash node does not match the payload.
    HashMismatch { image: String, expected: u32, actual: u32 },
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitError::Fdt(err) => write!(f, "invalid FIT container: {}", err),
            FitError::NotAFit => write!(f, "image has no /images node"),
            FitError::ImageNotFound(name) => write!(f, "FIT sub-image {} not found", name),
            FitError::MissingData(name) => write!(f, "FIT sub-image {} has no data", name),
            FitError::HashMismatch { image, expected, actual } => {
                write!(f, "FIT sub-image {} crc32 mismatch: expected {:#010x}, got {:#010x}", image, expected, actual)
            }
        }
    }
}

impl From<FdtError> for FitError {
    fn from(err: FdtError) -> Self {
        FitError::Fdt(err)
    }
}

impl From<FitError> for efi::Status {
    fn from(err: FitError) -> Self {
        match err {
            FitError::Fdt(err) => err.into(),
            FitError::NotAFit | FitError::MissingData(_) => efi::Status::INVALID_PARAMETER,
            FitError::ImageNotFound(_) => efi::Status::NOT_FOUND,
            FitError::HashMismatch { .. } => efi::Status::CRC_ERROR,
        }
    }
}

/// Returns true when the parsed tree looks like a FIT container.
pub fn is_fit(tree: &Fdt) -> bool {
    tree.node(IMAGES_PATH).is_some()
}

/// Extracts and verifies the payload of sub-image `name` from a parsed FIT.
pub fn image_data(tree: &Fdt, name: &str) -> Result<Vec<u8>, FitError> {
    let images = tree.node(IMAGES_PATH).ok_or(FitError::NotAFit)?;
    let image = images.subnode(name).ok_or_else(|| FitError::ImageNotFound(name.to_string()))?;
    let data = image.property("data").ok_or_else(|| FitError::MissingData(name.to_string()))?;

    verify_hashes(name, image, data)?;

    log::debug!(target: "fit", "sub-image {} is {} bytes", name, data.len());
    Ok(data.to_vec())
}

/// Parses `blob` as a FIT and extracts sub-image `name`.
pub fn extract_image(blob: &[u8], name: &str) -> Result<Vec<u8>, FitError> {
    let tree = Fdt::from_bytes(blob)?;
    image_data(&tree, name)
}

fn verify_hashes(name: &str, image: &Node, data: &[u8]) -> Result<(), FitError> {
    for hash in image.children.iter().filter(|n| n.name.starts_with("hash")) {
        match hash.property_str("algo") {
            Some("crc32") => {
                let expected = hash.property_u32("value").unwrap_or(0);
                let actual = crc32(data);
                if expected != actual {
                    return Err(FitError::HashMismatch { image: name.to_string(), expected, actual });
                }
            }
            Some(algo) => log::warn!(target: "fit", "{}: skipping unsupported hash algorithm {}", name, algo),
            None => log::warn!(target: "fit", "{}: hash node {} has no algo", name, hash.name),
        }
    }
    Ok(())
}

/// Builds a FIT holding the given sub-images, each with a crc32 hash node.
#[cfg(any(test, feature = "sim"))]
pub fn build_fit(images: &[(&str, &[u8])]) -> Vec<u8> {
    let mut tree = Fdt::default();
    tree.root.set_property_str("description", "test image");
    let node = tree.root.subnode_or_insert("images");
    for (name, data) in images {
        let image = node.subnode_or_insert(name);
        image.set_property("data", data.to_vec());
        let hash = image.subnode_or_insert("hash@1");
        hash.set_property_str("algo", "crc32");
        hash.set_property_u32("value", crc32(data));
    }
    tree.to_bytes()
}
