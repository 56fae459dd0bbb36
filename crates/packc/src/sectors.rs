//! Greedy packing of the expanded item list into capacity-bounded sectors.
//!
//! Items are first grouped into indivisible chunks: all arms of one union
//! (their storage overlaps) and everything under an atomic marker. Chunks
//! then fill sectors in order; items never reorder.

use crate::config::GenerationConfig;
use crate::diagnostics::{Diagnostic, Stage};
use crate::items::{offsets_and_sizes, Layout, PathSegment, SerializationItem};

#[derive(Debug, Clone, PartialEq)]
pub struct Sector {
    pub index: u32,
    pub items: Vec<SerializationItem>,
    /// Offsets relative to the start of this sector.
    pub layout: Layout,
}

impl Sector {
    pub fn bits_used(&self) -> u64 {
        self.layout.total_bits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutErrorKind {
    /// A single indivisible chunk exceeds one sector's capacity.
    SectorBudgetExceeded,
    TooManySectors,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutError {
    pub kind: LayoutErrorKind,
    pub message: String,
}

impl LayoutError {
    pub fn code(&self) -> &'static str {
        match self.kind {
            LayoutErrorKind::SectorBudgetExceeded => "PACKC-PACK-SECTOR",
            LayoutErrorKind::TooManySectors => "PACKC-PACK-COUNT",
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.code(), Stage::Pack, self.message.clone())
    }
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ChunkKey {
    /// Path prefix up to the first atomic member.
    Atomic(Vec<PathSegment>),
    /// Tag path shared by every arm of one union.
    Union(Vec<PathSegment>),
    Solo,
}

fn chunk_key(item: &SerializationItem) -> ChunkKey {
    let mut prefix = Vec::new();
    for seg in &item.segments {
        prefix.push(seg.clone());
        if let PathSegment::Member { options, .. } = seg {
            if options.never_split {
                return ChunkKey::Atomic(prefix);
            }
        }
    }
    if let Some(cond) = item.conditions.first() {
        return ChunkKey::Union(cond.lhs.clone());
    }
    ChunkKey::Solo
}

/// Maximal runs of items that must land in the same sector.
fn chunk_ranges(items: &[SerializationItem]) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0usize;
    while start < items.len() {
        let key = chunk_key(&items[start]);
        let mut end = start + 1;
        if key != ChunkKey::Solo {
            while end < items.len() && chunk_key(&items[end]) == key {
                end += 1;
            }
        }
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Pack an expanded item list into sectors of `config.sector_bytes` each,
/// at most `config.max_sectors` of them.
pub fn pack_sectors(
    config: &GenerationConfig,
    items: &[SerializationItem],
) -> Result<Vec<Sector>, LayoutError> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let capacity_bits = u64::from(config.sector_bytes) * 8;
    let global = offsets_and_sizes(config, items);
    let mut sectors: Vec<Sector> = Vec::new();
    let mut current: Vec<SerializationItem> = Vec::new();
    let mut current_bits = 0u64;

    for range in chunk_ranges(items) {
        let entries = &global.entries[range.clone()];
        let min_start = entries.iter().map(|(off, _)| *off).min().unwrap_or(0);
        let max_end = entries
            .iter()
            .map(|(off, size)| off + size)
            .max()
            .unwrap_or(min_start);
        let chunk_bits = max_end - min_start;
        if chunk_bits > capacity_bits {
            return Err(LayoutError {
                kind: LayoutErrorKind::SectorBudgetExceeded,
                message: format!(
                    "{} needs {chunk_bits} bits but a sector holds {capacity_bits}",
                    items[range.start].path_string()
                ),
            });
        }
        if current_bits + chunk_bits > capacity_bits {
            flush_sector(config, &mut sectors, &mut current);
            current_bits = 0;
        }
        current.extend(items[range].iter().cloned());
        current_bits += chunk_bits;
    }
    if !current.is_empty() {
        flush_sector(config, &mut sectors, &mut current);
    }
    if sectors.len() as u64 > u64::from(config.max_sectors) {
        return Err(LayoutError {
            kind: LayoutErrorKind::TooManySectors,
            message: format!(
                "layout needs {} sectors but at most {} are available",
                sectors.len(),
                config.max_sectors
            ),
        });
    }
    Ok(sectors)
}

fn flush_sector(config: &GenerationConfig, sectors: &mut Vec<Sector>, current: &mut Vec<SerializationItem>) {
    let items = std::mem::take(current);
    let layout = offsets_and_sizes(config, &items);
    sectors.push(Sector {
        index: sectors.len() as u32,
        items,
        layout,
    });
}
