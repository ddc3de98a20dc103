//! Named bus resources and the allocated offset map.
//!
//! Allocation order inside the segment:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ status region:   one 32-bit signal cell per node         │
//! ├──────────────────────────────────────────────────────────┤
//! │ checksum region: one u32 per block (integrity enabled)   │
//! ├──────────────────────────────────────────────────────────┤
//! │ block 0, block 1, ...   (declaration order)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every span is padded to 16 bytes. Checksum slots follow the block list
//! order. The map is immutable once computed.

use crate::error::PipelineError;
use std::collections::BTreeMap;

/// Required scheme prefix for resource names.
pub const BUS_SCHEME: &str = "bus://";

/// Element type of a bus block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F64,
    I32,
    U8,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::F64 => 8,
            ElementType::I32 => 4,
            ElementType::U8 => 1,
        }
    }
}

/// A declared resource: who writes it, who reads it, how big it is.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub name: String,
    pub size_bytes: usize,
    pub element_type: ElementType,
    pub producer: String,
    pub consumers: Vec<String>,
}

impl ResourceSpec {
    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        if !self.name.starts_with(BUS_SCHEME) {
            return Err(PipelineError::InvalidResourceName {
                name: self.name.clone(),
            });
        }
        if self.size_bytes == 0 {
            return Err(PipelineError::InvalidResource {
                name: self.name.clone(),
                reason: "size must be non-zero",
            });
        }
        if self.size_bytes % self.element_type.size() != 0 {
            return Err(PipelineError::InvalidResource {
                name: self.name.clone(),
                reason: "size is not a whole number of elements",
            });
        }
        Ok(())
    }
}

/// One allocated block.
#[derive(Debug, Clone)]
pub struct AllocatedBlock {
    pub name: String,
    pub offset: usize,
    pub len: usize,
    pub element_type: ElementType,
    /// Byte offset of this block's u32 slot in the checksum region.
    pub checksum_slot: Option<usize>,
}

fn align16(n: usize) -> usize {
    n.next_multiple_of(16)
}

/// The immutable allocation: node cells, block spans, checksum region.
#[derive(Debug, Clone)]
pub struct OffsetMap {
    /// Byte offset of the signal-cell status region.
    pub status_offset: usize,
    /// Node id -> signal cell index, lexicographic over node ids.
    node_cells: BTreeMap<String, usize>,
    /// Blocks in declaration order.
    blocks: Vec<AllocatedBlock>,
    /// `(offset, len)` of the checksum region when integrity is enabled.
    pub checksum_region: Option<(usize, usize)>,
    pub total_bytes: usize,
}

impl OffsetMap {
    /// Compute the map for `nodes` (any order; cells are assigned over the
    /// sorted ids) and `resources` (declaration order preserved).
    pub fn compute(
        node_ids: &[String],
        resources: &[ResourceSpec],
        with_checksums: bool,
    ) -> Self {
        let mut sorted: Vec<String> = node_ids.to_vec();
        sorted.sort();
        let node_cells: BTreeMap<String, usize> = sorted
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        let status_offset = 0;
        let status_len = align16(node_cells.len() * 4);

        let mut cursor = status_offset + status_len;
        let checksum_region = if with_checksums && !resources.is_empty() {
            let len = align16(resources.len() * 4);
            let region = (cursor, len);
            cursor += len;
            Some(region)
        } else {
            None
        };

        let mut blocks = Vec::with_capacity(resources.len());
        for (i, spec) in resources.iter().enumerate() {
            let len = align16(spec.size_bytes);
            blocks.push(AllocatedBlock {
                name: spec.name.clone(),
                offset: cursor,
                len: spec.size_bytes,
                element_type: spec.element_type,
                checksum_slot: checksum_region.map(|(off, _)| off + i * 4),
            });
            cursor += len;
        }

        Self {
            status_offset,
            node_cells,
            blocks,
            checksum_region,
            total_bytes: cursor,
        }
    }

    pub fn node_cell(&self, id: &str) -> Option<usize> {
        self.node_cells.get(id).copied()
    }

    pub fn node_count(&self) -> usize {
        self.node_cells.len()
    }

    pub fn block(&self, name: &str) -> Result<&AllocatedBlock, PipelineError> {
        self.blocks
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| PipelineError::UnknownBlock {
                name: name.to_string(),
            })
    }

    pub fn blocks(&self) -> &[AllocatedBlock] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, size: usize) -> ResourceSpec {
        ResourceSpec {
            name: name.to_string(),
            size_bytes: size,
            element_type: ElementType::F64,
            producer: "p".into(),
            consumers: vec!["c".into()],
        }
    }

    #[test]
    fn names_require_the_bus_scheme() {
        assert!(spec("bus://scenarios/rates", 800).validate().is_ok());
        assert!(matches!(
            spec("scenarios/rates", 800).validate(),
            Err(PipelineError::InvalidResourceName { .. })
        ));
    }

    #[test]
    fn size_must_fit_the_element_type() {
        let mut s = spec("bus://x", 12);
        assert!(matches!(
            s.validate(),
            Err(PipelineError::InvalidResource { .. })
        ));
        s.element_type = ElementType::I32;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn map_layout_is_aligned_and_ordered() {
        let nodes = vec!["esg".to_string(), "aggregation".to_string(), "projection".to_string()];
        let resources = vec![spec("bus://a", 800), spec("bus://b", 24)];
        let map = OffsetMap::compute(&nodes, &resources, true);

        // Cells follow lexicographic node order.
        assert_eq!(map.node_cell("aggregation"), Some(0));
        assert_eq!(map.node_cell("esg"), Some(1));
        assert_eq!(map.node_cell("projection"), Some(2));
        assert_eq!(map.node_cell("ghost"), None);

        // Status (3 cells -> 16 B), checksums (2 slots -> 16 B), blocks.
        assert_eq!(map.status_offset, 0);
        let (ck_off, ck_len) = map.checksum_region.unwrap();
        assert_eq!(ck_off, 16);
        assert_eq!(ck_len, 16);

        let a = map.block("bus://a").unwrap();
        let b = map.block("bus://b").unwrap();
        assert_eq!(a.offset, 32);
        assert_eq!(a.offset % 16, 0);
        assert_eq!(b.offset, 32 + 800);
        assert_eq!(b.len, 24);
        assert_eq!(a.checksum_slot, Some(16));
        assert_eq!(b.checksum_slot, Some(20));
        assert_eq!(map.total_bytes, 32 + 800 + 32);
    }

    #[test]
    fn checksum_region_is_absent_when_disabled() {
        let map = OffsetMap::compute(&["n".to_string()], &[spec("bus://a", 16)], false);
        assert!(map.checksum_region.is_none());
        assert!(map.block("bus://a").unwrap().checksum_slot.is_none());
        assert_eq!(map.block("bus://a").unwrap().offset, 16);
    }
}
