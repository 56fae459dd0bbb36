//! Post-generation layout queries: where did a field land?
//!
//! Built from the fully expanded per-sector item lists, so every array
//! element and union arm is individually addressable by its dotted path.

use crate::items::SerializationItem;
use crate::options::ShapeKind;
use crate::sectors::Sector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLocation {
    pub sector: u32,
    /// Offset from the start of the sector, in bits.
    pub bit_offset: u64,
    pub bit_size: u64,
}

#[derive(Debug, Clone)]
struct SectorSpan {
    index: u32,
    items: Vec<SerializationItem>,
    entries: Vec<(u64, u64)>,
    bits_used: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LayoutQueryCache {
    sectors: Vec<SectorSpan>,
}

impl LayoutQueryCache {
    pub fn from_sectors(sectors: &[Sector]) -> Self {
        LayoutQueryCache {
            sectors: sectors
                .iter()
                .map(|s| SectorSpan {
                    index: s.index,
                    items: s.items.clone(),
                    entries: s.layout.entries.clone(),
                    bits_used: s.layout.total_bits,
                })
                .collect(),
        }
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn sector_bits(&self, sector: u32) -> Option<u64> {
        self.sectors
            .iter()
            .find(|s| s.index == sector)
            .map(|s| s.bits_used)
    }

    /// Locate a field by dotted path, e.g. `party[2].hp`. Indexing one step
    /// into an opaque buffer or string resolves to the byte at that index.
    pub fn query(&self, path: &str) -> Option<FieldLocation> {
        for sector in &self.sectors {
            for (item, (offset, size)) in sector.items.iter().zip(&sector.entries) {
                let base = item.path_string();
                if path == base {
                    return Some(FieldLocation {
                        sector: sector.index,
                        bit_offset: *offset,
                        bit_size: *size,
                    });
                }
                if let Some(rest) = path.strip_prefix(base.as_str()) {
                    if let Some(idx) = parse_single_index(rest) {
                        if byte_addressable(item) && (idx + 1) * 8 <= *size {
                            return Some(FieldLocation {
                                sector: sector.index,
                                bit_offset: offset + idx * 8,
                                bit_size: 8,
                            });
                        }
                    }
                }
            }
        }
        None
    }

    pub fn containing_sector(&self, path: &str) -> Option<u32> {
        self.query(path).map(|loc| loc.sector)
    }
}

fn byte_addressable(item: &SerializationItem) -> bool {
    let Some(opts) = item.leaf_options() else {
        return false;
    };
    let shape = match &opts.shape {
        ShapeKind::Transformed { options, .. } => &options.shape,
        other => other,
    };
    matches!(shape, ShapeKind::Buffer { .. } | ShapeKind::Text { .. })
}

fn parse_single_index(rest: &str) -> Option<u64> {
    let inner = rest.strip_prefix('[')?.strip_suffix(']')?;
    inner.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationConfig;
    use crate::items::{offsets_and_sizes, PathSegment};
    use crate::options::FieldOptions;

    fn opts(shape: ShapeKind) -> FieldOptions {
        FieldOptions {
            shape,
            extents: Vec::new(),
            omitted: false,
            default_value: None,
            union_member_id: None,
            never_split: false,
            pad_bits: None,
            stat_categories: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn sector_of(items: Vec<SerializationItem>) -> Sector {
        let config = GenerationConfig::default();
        let layout = offsets_and_sizes(&config, &items);
        Sector {
            index: 0,
            items,
            layout,
        }
    }

    #[test]
    fn paths_resolve_to_sector_relative_offsets() {
        let hp = SerializationItem {
            segments: vec![PathSegment::member(
                "hp",
                opts(ShapeKind::Integral {
                    bits: 7,
                    min: 0,
                    max: 100,
                    signed: false,
                }),
            )],
            conditions: Vec::new(),
            omitted: false,
            defaulted: false,
        };
        let mut elem = SerializationItem {
            segments: vec![PathSegment::member(
                "inv",
                opts(ShapeKind::Integral {
                    bits: 9,
                    min: 0,
                    max: 511,
                    signed: false,
                }),
            )],
            conditions: Vec::new(),
            omitted: false,
            defaulted: false,
        };
        elem.segments.push(PathSegment::Slice { start: 1, count: 1 });
        let cache = LayoutQueryCache::from_sectors(&[sector_of(vec![hp, elem])]);
        assert_eq!(
            cache.query("hp"),
            Some(FieldLocation {
                sector: 0,
                bit_offset: 0,
                bit_size: 7,
            })
        );
        assert_eq!(
            cache.query("inv[1]"),
            Some(FieldLocation {
                sector: 0,
                bit_offset: 7,
                bit_size: 9,
            })
        );
        assert_eq!(cache.query("missing"), None);
    }

    #[test]
    fn buffer_bytes_are_addressable_without_expansion() {
        let blob = SerializationItem {
            segments: vec![PathSegment::member("blob", opts(ShapeKind::Buffer { bytes: 4 }))],
            conditions: Vec::new(),
            omitted: false,
            defaulted: false,
        };
        let cache = LayoutQueryCache::from_sectors(&[sector_of(vec![blob])]);
        assert_eq!(
            cache.query("blob[2]"),
            Some(FieldLocation {
                sector: 0,
                bit_offset: 16,
                bit_size: 8,
            })
        );
        assert_eq!(cache.query("blob[4]"), None);
    }
}
