//! Flattened Device Tree (FDT) editing.
//!
//! The MC consumes its DPC and DPL as FDT blobs, the firmware arrives wrapped in a FIT image (also
//! an FDT), and the OS device tree needs an `iommu-map` fixup. All of these are parsed into an
//! owned tree, edited, and serialized back to a blob.
//!
//! FDT format: <https://devicetree-specification.readthedocs.io/>
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

/// FDT magic number (big-endian in the blob).
pub const FDT_MAGIC: u32 = 0xd00d_feed;
/// Size of the blob header in bytes.
pub const FDT_HEADER_SIZE: usize = 40;

const FDT_BEGIN_NODE: u32 = 0x0000_0001;
const FDT_END_NODE: u32 = 0x0000_0002;
const FDT_PROP: u32 = 0x0000_0003;
const FDT_NOP: u32 = 0x0000_0004;
const FDT_END: u32 = 0x0000_0009;

const FDT_VERSION: u32 = 17;
const FDT_LAST_COMPATIBLE_VERSION: u32 = 16;

/// Errors raised while parsing or editing a device tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdtError {
    /// The blob does not start with [`FDT_MAGIC`].
    BadMagic(u32),
    /// The blob version is not one this parser understands.
    BadVersion(u32),
    /// A header field or token points outside the blob.
    Truncated,
    /// The structure block contains an unexpected token.
    BadStructure(u32),
    /// A node or property name is not valid UTF-8 or is unterminated.
    BadString,
    /// The requested node does not exist. The `String` is the path.
    NotFound(String),
    /// A node with that name already exists. The `String` is the name.
    Exists(String),
}

impl fmt::Display for FdtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdtError::BadMagic(magic) => write!(f, "bad FDT magic {:#010x}", magic),
            FdtError::BadVersion(version) => write!(f, "unsupported FDT version {}", version),
            FdtError::Truncated => write!(f, "FDT blob is truncated"),
            FdtError::BadStructure(token) => write!(f, "unexpected FDT token {:#x}", token),
            FdtError::BadString => write!(f, "malformed FDT string"),
            FdtError::NotFound(path) => write!(f, "FDT node {} not found", path),
            FdtError::Exists(name) => write!(f, "FDT node {} already exists", name),
        }
    }
}

impl From<FdtError> for efi::Status {
    fn from(err: FdtError) -> Self {
        match err {
            FdtError::NotFound(_) => efi::Status::NOT_FOUND,
            FdtError::Exists(_) => efi::Status::DEVICE_ERROR,
            _ => efi::Status::INVALID_PARAMETER,
        }
    }
}

/// Fixed-size header at the start of every blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtHeader {
    pub magic: u32,
    pub total_size: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl FdtHeader {
    /// Decodes and validates the header at the start of `data`.
    ///
    /// Only the header is examined, so this can be used on the first [`FDT_HEADER_SIZE`] bytes of
    /// an image to learn how much more to read.
    pub fn parse(data: &[u8]) -> Result<Self, FdtError> {
        if data.len() < FDT_HEADER_SIZE {
            return Err(FdtError::Truncated);
        }

        let header = Self {
            magic: be32(data, 0)?,
            total_size: be32(data, 4)?,
            off_dt_struct: be32(data, 8)?,
            off_dt_strings: be32(data, 12)?,
            off_mem_rsvmap: be32(data, 16)?,
            version: be32(data, 20)?,
            last_comp_version: be32(data, 24)?,
            boot_cpuid_phys: be32(data, 28)?,
            size_dt_strings: be32(data, 32)?,
            size_dt_struct: be32(data, 36)?,
        };

        if header.magic != FDT_MAGIC {
            return Err(FdtError::BadMagic(header.magic));
        }
        if header.version < FDT_LAST_COMPATIBLE_VERSION || header.last_comp_version > FDT_VERSION {
            return Err(FdtError::BadVersion(header.version));
        }
        if (header.total_size as usize) < FDT_HEADER_SIZE {
            return Err(FdtError::Truncated);
        }

        Ok(header)
    }
}

/// A named property and its raw (big-endian) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: Vec<u8>,
}

/// One device tree node with its properties and children, in blob order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), properties: Vec::new(), children: Vec::new() }
    }

    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties.iter().find(|p| p.name == name).map(|p| p.value.as_slice())
    }

    /// First cell of a property as a big-endian `u32`.
    pub fn property_u32(&self, name: &str) -> Option<u32> {
        let value = self.property(name)?;
        let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// All cells of a property; `None` if the length is not a multiple of four.
    pub fn property_u32_cells(&self, name: &str) -> Option<Vec<u32>> {
        let value = self.property(name)?;
        if value.len() % 4 != 0 {
            return None;
        }
        Some(value.chunks_exact(4).map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect())
    }

    /// A NUL-terminated string property.
    pub fn property_str(&self, name: &str) -> Option<&str> {
        let value = self.property(name)?;
        let end = value.iter().position(|&b| b == 0)?;
        core::str::from_utf8(&value[..end]).ok()
    }

    /// Replaces or appends a property.
    pub fn set_property(&mut self, name: &str, value: Vec<u8>) {
        match self.properties.iter_mut().find(|p| p.name == name) {
            Some(property) => property.value = value,
            None => self.properties.push(Property { name: name.to_string(), value }),
        }
    }

    pub fn set_property_u32(&mut self, name: &str, value: u32) {
        self.set_property(name, value.to_be_bytes().to_vec());
    }

    pub fn set_property_u32_cells(&mut self, name: &str, cells: &[u32]) {
        let value = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.set_property(name, value);
    }

    pub fn set_property_str(&mut self, name: &str, value: &str) {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.set_property(name, bytes);
    }

    pub fn remove_property(&mut self, name: &str) -> bool {
        let before = self.properties.len();
        self.properties.retain(|p| p.name != name);
        before != self.properties.len()
    }

    /// Finds a direct child. A name without a unit address also matches `name@unit`.
    pub fn subnode(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|n| name_matches(&n.name, name))
    }

    pub fn subnode_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|n| name_matches(&n.name, name))
    }

    /// Appends an empty child and returns it.
    pub fn add_subnode(&mut self, name: &str) -> Result<&mut Node, FdtError> {
        if self.children.iter().any(|n| n.name == name) {
            return Err(FdtError::Exists(name.to_string()));
        }
        self.children.push(Node::new(name));
        let last = self.children.len() - 1;
        Ok(&mut self.children[last])
    }

    /// Returns the existing child or appends a new empty one.
    pub fn subnode_or_insert(&mut self, name: &str) -> &mut Node {
        match self.children.iter().position(|n| n.name == name) {
            Some(index) => &mut self.children[index],
            None => {
                self.children.push(Node::new(name));
                let last = self.children.len() - 1;
                &mut self.children[last]
            }
        }
    }
}

fn name_matches(node_name: &str, wanted: &str) -> bool {
    if node_name == wanted {
        return true;
    }
    !wanted.contains('@') && node_name.split('@').next() == Some(wanted)
}

/// An owned, editable device tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fdt {
    pub boot_cpuid_phys: u32,
    pub reserved_memory: Vec<(u64, u64)>,
    pub root: Node,
}

impl Default for Fdt {
    fn default() -> Self {
        Self { boot_cpuid_phys: 0, reserved_memory: Vec::new(), root: Node::new("") }
    }
}

impl Fdt {
    /// Parses a complete blob. Bytes past the header's `totalsize` are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FdtError> {
        let header = FdtHeader::parse(data)?;
        let total = header.total_size as usize;
        if total > data.len() {
            return Err(FdtError::Truncated);
        }
        let blob = &data[..total];

        let struct_start = header.off_dt_struct as usize;
        let struct_end = struct_start.checked_add(header.size_dt_struct as usize).ok_or(FdtError::Truncated)?;
        let strings_start = header.off_dt_strings as usize;
        let strings_end = strings_start.checked_add(header.size_dt_strings as usize).ok_or(FdtError::Truncated)?;
        if struct_end > total || strings_end > total {
            return Err(FdtError::Truncated);
        }
        let structure = &blob[struct_start..struct_end];
        let strings = &blob[strings_start..strings_end];

        let reserved_memory = parse_reserve_map(blob, header.off_mem_rsvmap as usize)?;
        let root = parse_structure(structure, strings)?;

        Ok(Self { boot_cpuid_phys: header.boot_cpuid_phys, reserved_memory, root })
    }

    /// Serializes the tree into a version 17 blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut strings = StringTable::default();
        let mut structure = Vec::new();
        emit_node(&self.root, &mut structure, &mut strings);
        structure.extend_from_slice(&FDT_END.to_be_bytes());

        let off_mem_rsvmap = FDT_HEADER_SIZE;
        let rsvmap_size = (self.reserved_memory.len() + 1) * 16;
        let off_dt_struct = off_mem_rsvmap + rsvmap_size;
        let off_dt_strings = off_dt_struct + structure.len();
        let total_size = off_dt_strings + strings.data.len();

        let mut blob = Vec::with_capacity(total_size);
        for field in [
            FDT_MAGIC,
            total_size as u32,
            off_dt_struct as u32,
            off_dt_strings as u32,
            off_mem_rsvmap as u32,
            FDT_VERSION,
            FDT_LAST_COMPATIBLE_VERSION,
            self.boot_cpuid_phys,
            strings.data.len() as u32,
            structure.len() as u32,
        ] {
            blob.extend_from_slice(&field.to_be_bytes());
        }
        for (address, size) in self.reserved_memory.iter().chain(core::iter::once(&(0, 0))) {
            blob.extend_from_slice(&address.to_be_bytes());
            blob.extend_from_slice(&size.to_be_bytes());
        }
        blob.extend_from_slice(&structure);
        blob.extend_from_slice(&strings.data);
        blob
    }

    /// Looks up an absolute path such as `/resources/icid_pools`.
    pub fn node(&self, path: &str) -> Option<&Node> {
        let mut node = &self.root;
        for component in path_components(path) {
            node = node.subnode(component)?;
        }
        Some(node)
    }

    pub fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for component in path_components(path) {
            node = node.subnode_mut(component)?;
        }
        Some(node)
    }

    /// Removes the node at `path` together with its subtree.
    pub fn delete_node(&mut self, path: &str) -> Result<(), FdtError> {
        let (parent_path, name) = match path.trim_end_matches('/').rsplit_once('/') {
            Some((parent, name)) if !name.is_empty() => (parent, name),
            _ => return Err(FdtError::NotFound(path.to_string())),
        };
        let parent = self.node_mut(parent_path).ok_or_else(|| FdtError::NotFound(path.to_string()))?;
        let index = parent
            .children
            .iter()
            .position(|n| name_matches(&n.name, name))
            .ok_or_else(|| FdtError::NotFound(path.to_string()))?;
        parent.children.remove(index);
        Ok(())
    }
}

fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

fn be32(data: &[u8], offset: usize) -> Result<u32, FdtError> {
    let bytes = data.get(offset..offset + 4).ok_or(FdtError::Truncated)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn be64(data: &[u8], offset: usize) -> Result<u64, FdtError> {
    Ok((u64::from(be32(data, offset)?) << 32) | u64::from(be32(data, offset + 4)?))
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

fn c_string(data: &[u8], offset: usize) -> Result<&str, FdtError> {
    let tail = data.get(offset..).ok_or(FdtError::Truncated)?;
    let end = tail.iter().position(|&b| b == 0).ok_or(FdtError::BadString)?;
    core::str::from_utf8(&tail[..end]).map_err(|_| FdtError::BadString)
}

fn parse_reserve_map(blob: &[u8], offset: usize) -> Result<Vec<(u64, u64)>, FdtError> {
    let mut entries = Vec::new();
    let mut cursor = offset;
    loop {
        let address = be64(blob, cursor)?;
        let size = be64(blob, cursor + 8)?;
        cursor += 16;
        if address == 0 && size == 0 {
            return Ok(entries);
        }
        entries.push((address, size));
    }
}

fn parse_structure(structure: &[u8], strings: &[u8]) -> Result<Node, FdtError> {
    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;
    let mut offset = 0;

    loop {
        let token = be32(structure, offset)?;
        offset += 4;

        match token {
            FDT_BEGIN_NODE => {
                if root.is_some() {
                    return Err(FdtError::BadStructure(token));
                }
                let name = c_string(structure, offset)?;
                offset = align4(offset + name.len() + 1);
                stack.push(Node::new(name));
            }
            FDT_END_NODE => {
                let node = stack.pop().ok_or(FdtError::BadStructure(token))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            FDT_PROP => {
                let length = be32(structure, offset)? as usize;
                let name_offset = be32(structure, offset + 4)? as usize;
                offset += 8;
                let value = structure.get(offset..offset + length).ok_or(FdtError::Truncated)?;
                offset = align4(offset + length);
                let name = c_string(strings, name_offset)?;
                let node = stack.last_mut().ok_or(FdtError::BadStructure(token))?;
                node.properties.push(Property { name: name.to_string(), value: value.to_vec() });
            }
            FDT_NOP => {}
            FDT_END => {
                if !stack.is_empty() {
                    return Err(FdtError::BadStructure(token));
                }
                return root.ok_or(FdtError::BadStructure(token));
            }
            other => return Err(FdtError::BadStructure(other)),
        }
    }
}

#[derive(Default)]
struct StringTable {
    data: Vec<u8>,
}

impl StringTable {
    fn offset_of(&mut self, name: &str) -> u32 {
        let mut start = 0;
        while start < self.data.len() {
            let end = start + self.data[start..].iter().position(|&b| b == 0).unwrap_or(0);
            if &self.data[start..end] == name.as_bytes() {
                return start as u32;
            }
            start = end + 1;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        offset
    }
}

fn pad4(buffer: &mut Vec<u8>) {
    while buffer.len() % 4 != 0 {
        buffer.push(0);
    }
}

fn emit_node(node: &Node, out: &mut Vec<u8>, strings: &mut StringTable) {
    out.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
    out.extend_from_slice(node.name.as_bytes());
    out.push(0);
    pad4(out);

    for property in &node.properties {
        out.extend_from_slice(&FDT_PROP.to_be_bytes());
        out.extend_from_slice(&(property.value.len() as u32).to_be_bytes());
        out.extend_from_slice(&strings.offset_of(&property.name).to_be_bytes());
        out.extend_from_slice(&property.value);
        pad4(out);
    }

    for child in &node.children {
        emit_node(child, out, strings);
    }

    out.extend_from_slice(&FDT_END_NODE.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Fdt {
        let mut fdt = Fdt::default();
        fdt.root.set_property_u32("#address-cells", 2);
        let resources = fdt.root.add_subnode("resources").unwrap();
        let pools = resources.add_subnode("icid_pools").unwrap();
        let pool = pools.add_subnode("icid_pool@0").unwrap();
        pool.set_property_u32("base_icid", 10);
        pool.set_property_u32("num", 20);
        let log = fdt.root.add_subnode("mc_general").unwrap().add_subnode("log").unwrap();
        log.set_property_str("mode", "LOG_MODE_ON");
        fdt
    }

    #[test]
    fn test_serialize_then_parse_preserves_tree() {
        let mut fdt = sample_tree();
        fdt.reserved_memory.push((0x8000_0000, 0x1000));
        let blob = fdt.to_bytes();

        let header = FdtHeader::parse(&blob).unwrap();
        assert_eq!(header.total_size as usize, blob.len());
        assert_eq!(header.version, 17);

        let parsed = Fdt::from_bytes(&blob).unwrap();
        assert_eq!(parsed, fdt);
    }

    #[test]
    fn test_strings_are_deduplicated() {
        let mut fdt = Fdt::default();
        fdt.root.add_subnode("a").unwrap().set_property_u32("num", 1);
        fdt.root.add_subnode("b").unwrap().set_property_u32("num", 2);
        let blob = fdt.to_bytes();
        let header = FdtHeader::parse(&blob).unwrap();
        assert_eq!(header.size_dt_strings, 4);
    }

    #[test]
    fn test_path_lookup_with_and_without_unit_address() {
        let fdt = sample_tree();
        assert_eq!(fdt.node("/resources/icid_pools/icid_pool@0").unwrap().property_u32("base_icid"), Some(10));
        assert_eq!(fdt.node("/resources/icid_pools/icid_pool").unwrap().property_u32("num"), Some(20));
        assert!(fdt.node("/resources/icid_pools/icid_pool@1").is_none());
        assert_eq!(fdt.node("/mc_general/log").unwrap().property_str("mode"), Some("LOG_MODE_ON"));
        assert!(fdt.node("/").is_some());
    }

    #[test]
    fn test_delete_node() {
        let mut fdt = sample_tree();
        fdt.delete_node("/resources/icid_pools").unwrap();
        assert!(fdt.node("/resources/icid_pools").is_none());
        assert!(fdt.node("/resources").is_some());
        assert_eq!(fdt.delete_node("/resources/icid_pools"), Err(FdtError::NotFound("/resources/icid_pools".into())));
        assert!(fdt.delete_node("/").is_err());
    }

    #[test]
    fn test_add_existing_subnode_fails() {
        let mut fdt = sample_tree();
        assert_eq!(fdt.root.add_subnode("resources").err(), Some(FdtError::Exists("resources".into())));
        let again = fdt.root.subnode_or_insert("resources");
        assert_eq!(again.children.len(), 1);
    }

    #[test]
    fn test_property_helpers() {
        let mut node = Node::new("x");
        node.set_property_u32_cells("iommu-map", &[0, 7, 23, 41]);
        assert_eq!(node.property_u32_cells("iommu-map"), Some(vec![0, 7, 23, 41]));
        node.set_property("odd", vec![1, 2, 3]);
        assert_eq!(node.property_u32_cells("odd"), None);
        assert_eq!(node.property_u32("odd"), None);
        assert!(node.remove_property("odd"));
        assert!(!node.remove_property("odd"));
        node.set_property_u32("iommu-map", 5);
        assert_eq!(node.properties.len(), 1);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut blob = sample_tree().to_bytes();
        blob[0] = 0;
        assert!(matches!(Fdt::from_bytes(&blob), Err(FdtError::BadMagic(_))));
        assert_eq!(efi::Status::from(FdtError::BadMagic(0)), efi::Status::INVALID_PARAMETER);
    }

    #[test]
    fn test_rejects_truncated_blob() {
        let blob = sample_tree().to_bytes();
        assert_eq!(Fdt::from_bytes(&blob[..blob.len() - 8]), Err(FdtError::Truncated));
        assert_eq!(FdtHeader::parse(&blob[..20]), Err(FdtError::Truncated));
    }

    #[test]
    fn test_rejects_unknown_token() {
        let mut blob = sample_tree().to_bytes();
        let header = FdtHeader::parse(&blob).unwrap();
        let first_token = header.off_dt_struct as usize;
        blob[first_token..first_token + 4].copy_from_slice(&0x42u32.to_be_bytes());
        assert_eq!(Fdt::from_bytes(&blob), Err(FdtError::BadStructure(0x42)));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut blob = sample_tree().to_bytes();
        blob.extend_from_slice(&[0xAA; 64]);
        assert_eq!(Fdt::from_bytes(&blob).unwrap(), sample_tree());
    }
}
