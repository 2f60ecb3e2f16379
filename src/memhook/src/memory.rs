//! Local mirror of emulator memory.
//!
//! Drivers fetch [`MemoryAddressBlock`]s and hand back
//! [`MemoryAddressBlockResult`]s, which the engine merges into a
//! [`MemoryStore`]. The store is split into namespaces: the default one is
//! filled only by the engine's fetch phase, custom ones are filled by mapper
//! scripts.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Address in the emulated machine's address space.
pub type MemoryAddress = u32;

/// Name of the namespace the engine's fetch phase writes into.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A named, inclusive address range to fetch in one driver call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAddressBlock {
    pub label: String,
    pub start: MemoryAddress,
    pub end: MemoryAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl MemoryAddressBlock {
    pub fn new(label: impl Into<String>, start: MemoryAddress, end: MemoryAddress) -> Self {
        Self {
            label: label.into(),
            start,
            end,
            namespace: None,
        }
    }

    /// Route the fetched bytes into a custom namespace instead of the default one.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Number of bytes covered (the end address is inclusive).
    pub fn len(&self) -> usize {
        (self.end.saturating_sub(self.start) as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }
}

impl fmt::Display for MemoryAddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:#06x}..={:#06x}]", self.label, self.start, self.end)
    }
}

/// Bytes a driver fetched for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAddressBlockResult {
    pub block: MemoryAddressBlock,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
}

impl MemoryAddressBlockResult {
    pub fn new(block: MemoryAddressBlock, data: Vec<u8>) -> Self {
        Self { block, data }
    }
}

/// Sparse byte buffer keyed by address.
///
/// Fragments never overlap: filling a range that touches existing fragments
/// merges them into a single fragment, with the new bytes written on top.
#[derive(Debug, Clone, Default)]
pub struct MemoryNamespace {
    fragments: BTreeMap<MemoryAddress, Vec<u8>>,
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `data` starting at `address`, replacing whatever was there.
    pub fn fill(&mut self, address: MemoryAddress, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let start = address as u64;
        let end = start + data.len() as u64;

        // Fragments that overlap or touch [start, end)
        let touching: Vec<MemoryAddress> = self
            .fragments
            .range(..=end.min(MemoryAddress::MAX as u64) as MemoryAddress)
            .filter(|(&s, bytes)| s as u64 + bytes.len() as u64 >= start && s as u64 <= end)
            .map(|(&s, _)| s)
            .collect();

        if let [only] = touching.as_slice() {
            let existing = self.fragments.get_mut(only).map(|v| (*only, v));
            if let Some((frag_start, bytes)) = existing {
                let frag_end = frag_start as u64 + bytes.len() as u64;
                if frag_start as u64 <= start && end <= frag_end {
                    let offset = (start - frag_start as u64) as usize;
                    bytes[offset..offset + data.len()].copy_from_slice(data);
                    return;
                }
            }
        }

        let mut merged_start = start;
        let mut merged_end = end;
        for s in &touching {
            let len = self.fragments[s].len() as u64;
            merged_start = merged_start.min(*s as u64);
            merged_end = merged_end.max(*s as u64 + len);
        }

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for s in touching {
            if let Some(bytes) = self.fragments.remove(&s) {
                let offset = (s as u64 - merged_start) as usize;
                merged[offset..offset + bytes.len()].copy_from_slice(&bytes);
            }
        }
        let offset = (start - merged_start) as usize;
        merged[offset..offset + data.len()].copy_from_slice(data);

        self.fragments.insert(merged_start as MemoryAddress, merged);
    }

    /// Borrow `length` bytes at `address`, if a single fill covered them.
    pub fn get(&self, address: MemoryAddress, length: usize) -> Option<&[u8]> {
        let (&frag_start, bytes) = self.fragments.range(..=address).next_back()?;
        let offset = (address - frag_start) as usize;
        let end = offset.checked_add(length)?;
        if end > bytes.len() {
            return None;
        }
        Some(&bytes[offset..end])
    }

    /// Total number of bytes held.
    pub fn len(&self) -> usize {
        self.fragments.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Iterate `(start, bytes)` fragments in address order.
    pub fn fragments(&self) -> impl Iterator<Item = (MemoryAddress, &[u8])> {
        self.fragments.iter().map(|(&s, b)| (s, b.as_slice()))
    }
}

/// The engine-owned memory mirror.
#[derive(Debug, Default)]
pub struct MemoryStore {
    default: MemoryNamespace,
    custom: HashMap<String, MemoryNamespace>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(&self, name: &str) -> Option<&MemoryNamespace> {
        if name == DEFAULT_NAMESPACE {
            Some(&self.default)
        } else {
            self.custom.get(name)
        }
    }

    /// Get or create a namespace for writing.
    pub fn namespace_mut(&mut self, name: &str) -> &mut MemoryNamespace {
        if name == DEFAULT_NAMESPACE {
            &mut self.default
        } else {
            self.custom.entry(name.to_string()).or_default()
        }
    }

    /// Merge a fetched block into the namespace it was requested for.
    pub fn apply(&mut self, result: &MemoryAddressBlockResult) {
        self.namespace_mut(result.block.namespace())
            .fill(result.block.start, &result.data);
    }

    /// Copy `length` bytes out of a namespace.
    pub fn read(&self, namespace: &str, address: MemoryAddress, length: usize) -> Result<Vec<u8>> {
        self.namespace(namespace)
            .and_then(|ns| ns.get(address, length))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::MemoryUnmapped {
                namespace: namespace.to_string(),
                address,
                length,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len_is_inclusive() {
        let block = MemoryAddressBlock::new("wram", 0x0000, 0x00FF);
        assert_eq!(block.len(), 0x100);
        assert_eq!(block.namespace(), DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_fill_and_get() {
        let mut ns = MemoryNamespace::new();
        ns.fill(0x1000, &[1, 2, 3, 4]);

        assert_eq!(ns.get(0x1000, 4), Some(&[1, 2, 3, 4][..]));
        assert_eq!(ns.get(0x1002, 2), Some(&[3, 4][..]));
        assert_eq!(ns.get(0x1002, 3), None);
        assert_eq!(ns.get(0x0FFF, 1), None);
    }

    #[test]
    fn test_fill_overwrites_inside_fragment() {
        let mut ns = MemoryNamespace::new();
        ns.fill(0x10, &[0; 8]);
        ns.fill(0x12, &[9, 9]);

        assert_eq!(ns.get(0x10, 8), Some(&[0, 0, 9, 9, 0, 0, 0, 0][..]));
        assert_eq!(ns.fragments().count(), 1);
    }

    #[test]
    fn test_fill_merges_adjacent_and_overlapping() {
        let mut ns = MemoryNamespace::new();
        ns.fill(0x00, &[1, 1]);
        ns.fill(0x04, &[3, 3]);
        ns.fill(0x01, &[2, 2, 2, 2]);

        assert_eq!(ns.fragments().count(), 1);
        assert_eq!(ns.get(0x00, 6), Some(&[1, 2, 2, 2, 2, 3][..]));
        assert_eq!(ns.len(), 6);
    }

    #[test]
    fn test_disjoint_fragments_stay_separate() {
        let mut ns = MemoryNamespace::new();
        ns.fill(0x00, &[1]);
        ns.fill(0x10, &[2]);

        assert_eq!(ns.fragments().count(), 2);
        assert_eq!(ns.get(0x00, 0x11), None);
    }

    #[test]
    fn test_store_routes_blocks_by_namespace() {
        let mut store = MemoryStore::new();
        store.apply(&MemoryAddressBlockResult::new(
            MemoryAddressBlock::new("a", 0x10, 0x11),
            vec![7, 8],
        ));
        store.apply(&MemoryAddressBlockResult::new(
            MemoryAddressBlock::new("b", 0x10, 0x10).with_namespace("decrypted"),
            vec![42],
        ));

        assert_eq!(store.read(DEFAULT_NAMESPACE, 0x10, 2).unwrap(), vec![7, 8]);
        assert_eq!(store.read("decrypted", 0x10, 1).unwrap(), vec![42]);
        assert!(matches!(
            store.read("missing", 0, 1),
            Err(Error::MemoryUnmapped { .. })
        ));
    }

    #[test]
    fn test_block_result_serializes_hex() {
        let result =
            MemoryAddressBlockResult::new(MemoryAddressBlock::new("r", 0, 2), vec![0xde, 0xad, 0x01]);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"dead01\""));

        let back: MemoryAddressBlockResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
