//! Per-stream statistics table assigning Huffman tags to encoding profiles.
//!
//! Every quantized element registers one `(length, shift, absolute)` profile
//! for its attribute kind. Once the whole stream has been tallied,
//! [`HuffmanTable::compute_tags`] assigns prefix-free tags of at most
//! [`MAX_TAG_LENGTH`] bits. When the frequency distribution would need longer
//! tags, the rarest profile is folded into a wider profile that can carry its
//! values, so a looked-up node may have a larger data length or a smaller
//! shift than the profile it was registered under.

use crate::command::{CommandStream, COLOR_TABLE, NORMAL_TABLE, POSITION_TABLE, SET_TABLE};
use crate::common::NORMAL_QUANT_MAX;
use crate::error::CgError;
use foldhash::{HashMap, HashMapExt};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::{debug, trace};

pub const MAX_TAG_LENGTH: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Position,
    Color,
    Normal,
}

impl TableKind {
    pub const ALL: [TableKind; 3] = [TableKind::Position, TableKind::Color, TableKind::Normal];

    pub(crate) const fn id(self) -> u32 {
        match self {
            TableKind::Position => POSITION_TABLE,
            TableKind::Color => COLOR_TABLE,
            TableKind::Normal => NORMAL_TABLE,
        }
    }

    /// Widest data field a merged node may take on. Absolute normal indices
    /// are unsigned and never exceed the finest grid width; the normal table
    /// has no escape for a 16-bit field.
    const fn max_length(self, absolute: bool) -> u32 {
        match self {
            TableKind::Normal if absolute => NORMAL_QUANT_MAX + 1,
            TableKind::Normal => 15,
            _ => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EntryKey {
    length: u32,
    shift: u32,
    absolute: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuffmanNode {
    pub data_length: u32,
    pub shift: u32,
    pub absolute: bool,
    pub frequency: u64,
    pub tag: u32,
    pub tag_length: u32,
}

impl HuffmanNode {
    /// True if values described by `(length, shift)` fit this node's field.
    pub fn covers(&self, length: u32, shift: u32) -> bool {
        self.shift <= shift && self.data_length + self.shift >= length + shift
    }

    /// Tag bits as a string, most significant first.
    pub fn tag_string(&self) -> String {
        (0..self.tag_length)
            .rev()
            .map(|bit| if self.tag >> bit & 1 == 1 { '1' } else { '0' })
            .collect()
    }
}

#[derive(Debug)]
struct Group {
    length: u32,
    shift: u32,
    absolute: bool,
    frequency: u64,
    members: Vec<EntryKey>,
}

impl Group {
    fn cover(&self, other: &Group, max_length: u32) -> (u32, u32) {
        let shift = self.shift.min(other.shift);
        let top = (self.length + self.shift).max(other.length + other.shift);
        ((top - shift).min(max_length), shift)
    }

    fn merge_cost(&self, other: &Group, max_length: u32) -> u64 {
        let (length, _) = self.cover(other, max_length);
        self.frequency * u64::from(length - self.length.min(length))
            + other.frequency * u64::from(length - other.length.min(length))
    }
}

#[derive(Debug, Default)]
struct CodeTable {
    frequencies: HashMap<EntryKey, u64>,
    nodes: Vec<HuffmanNode>,
    lookup: HashMap<EntryKey, usize>,
}

impl CodeTable {
    fn add(&mut self, key: EntryKey) {
        *self.frequencies.entry(key).or_insert(0) += 1;
    }

    fn compute_tags(&mut self, kind: TableKind) {
        let mut keys: Vec<(EntryKey, u64)> =
            self.frequencies.iter().map(|(k, f)| (*k, *f)).collect();
        keys.sort();

        let mut groups: Vec<Group> = keys
            .into_iter()
            .map(|(key, frequency)| Group {
                length: key.length,
                shift: key.shift,
                absolute: key.absolute,
                frequency,
                members: vec![key],
            })
            .collect();

        let mut lengths = code_lengths(&groups);
        while lengths.iter().any(|&l| l > MAX_TAG_LENGTH) {
            if !merge_rarest(&mut groups, kind) {
                break;
            }
            lengths = code_lengths(&groups);
        }

        // Canonical assignment: shorter tags first, most frequent first.
        let mut order: Vec<usize> = (0..groups.len()).collect();
        order.sort_by_key(|&i| (lengths[i], Reverse(groups[i].frequency), i));

        self.nodes.clear();
        self.lookup.clear();
        let mut code = 0_u32;
        let mut previous_length = order.first().map_or(0, |&i| lengths[i]);
        for i in order {
            code <<= lengths[i] - previous_length;
            previous_length = lengths[i];
            let group = &groups[i];
            let index = self.nodes.len();
            self.nodes.push(HuffmanNode {
                data_length: group.length,
                shift: group.shift,
                absolute: group.absolute,
                frequency: group.frequency,
                tag: code,
                tag_length: lengths[i],
            });
            for member in &group.members {
                self.lookup.insert(*member, index);
            }
            code += 1;
        }
        trace!(table = ?kind, nodes = self.nodes.len(), "assigned Huffman tags");
    }

    fn get(&self, key: EntryKey) -> Result<&HuffmanNode, CgError> {
        self.lookup
            .get(&key)
            .map(|&i| &self.nodes[i])
            .ok_or(CgError::UnregisteredEntry {
                length: key.length,
                shift: key.shift,
                absolute: key.absolute,
            })
    }
}

/// Huffman code lengths, reassigned so that no group gets a longer tag than
/// a less frequent one.
fn code_lengths(groups: &[Group]) -> Vec<u32> {
    let n = groups.len();
    if n <= 1 {
        return vec![1; n];
    }

    let mut parent = vec![usize::MAX; 2 * n - 1];
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = groups
        .iter()
        .enumerate()
        .map(|(i, g)| Reverse((g.frequency, i)))
        .collect();
    let mut next = n;
    while heap.len() > 1 {
        let (Some(Reverse((fa, a))), Some(Reverse((fb, b)))) = (heap.pop(), heap.pop()) else {
            break;
        };
        parent[a] = next;
        parent[b] = next;
        heap.push(Reverse((fa + fb, next)));
        next += 1;
    }

    let mut depths: Vec<u32> = (0..n)
        .map(|leaf| {
            let mut depth = 0;
            let mut node = leaf;
            while parent[node] != usize::MAX {
                node = parent[node];
                depth += 1;
            }
            depth
        })
        .collect();
    depths.sort_unstable();

    let mut by_frequency: Vec<usize> = (0..n).collect();
    by_frequency.sort_by_key(|&i| (Reverse(groups[i].frequency), i));
    let mut lengths = vec![0; n];
    for (rank, &i) in by_frequency.iter().enumerate() {
        lengths[i] = depths[rank];
    }
    lengths
}

/// Folds the rarest group that has a partner of the same absolute flag into
/// the partner that costs the fewest extra data bits.
fn merge_rarest(groups: &mut Vec<Group>, kind: TableKind) -> bool {
    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by_key(|&i| (groups[i].frequency, i));

    for a in order {
        let max_length = kind.max_length(groups[a].absolute);
        let partner = (0..groups.len())
            .filter(|&b| b != a && groups[b].absolute == groups[a].absolute)
            .min_by_key(|&b| (groups[a].merge_cost(&groups[b], max_length), b));
        if let Some(b) = partner {
            let (length, shift) = groups[a].cover(&groups[b], max_length);
            debug!(
                table = ?kind,
                from = ?(groups[a].length, groups[a].shift),
                into = ?(length, shift),
                "merging Huffman entries to bound tag length"
            );
            let merged = groups.swap_remove(a);
            let b = if b == groups.len() { a } else { b };
            let target = &mut groups[b];
            target.length = length;
            target.shift = shift;
            target.frequency += merged.frequency;
            target.members.extend(merged.members);
            return true;
        }
    }
    false
}

#[derive(Debug, Default)]
pub struct HuffmanTable {
    positions: CodeTable,
    colors: CodeTable,
    normals: CodeTable,
}

impl HuffmanTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: TableKind) -> &CodeTable {
        match kind {
            TableKind::Position => &self.positions,
            TableKind::Color => &self.colors,
            TableKind::Normal => &self.normals,
        }
    }

    fn table_mut(&mut self, kind: TableKind) -> &mut CodeTable {
        match kind {
            TableKind::Position => &mut self.positions,
            TableKind::Color => &mut self.colors,
            TableKind::Normal => &mut self.normals,
        }
    }

    pub fn add_entry(&mut self, kind: TableKind, length: u32, shift: u32, absolute: bool) {
        self.table_mut(kind).add(EntryKey {
            length,
            shift,
            absolute,
        });
    }

    pub fn add_position_entry(&mut self, length: u32, shift: u32, absolute: bool) {
        self.add_entry(TableKind::Position, length, shift, absolute);
    }

    pub fn add_color_entry(&mut self, length: u32, shift: u32, absolute: bool) {
        self.add_entry(TableKind::Color, length, shift, absolute);
    }

    pub fn add_normal_entry(&mut self, length: u32, shift: u32, absolute: bool) {
        self.add_entry(TableKind::Normal, length, shift, absolute);
    }

    /// Assigns tags for every registered profile of every attribute kind.
    pub fn compute_tags(&mut self) {
        for kind in TableKind::ALL {
            self.table_mut(kind).compute_tags(kind);
        }
    }

    pub fn get_entry(
        &self,
        kind: TableKind,
        length: u32,
        shift: u32,
        absolute: bool,
    ) -> Result<&HuffmanNode, CgError> {
        self.table(kind).get(EntryKey {
            length,
            shift,
            absolute,
        })
    }

    pub fn get_position_entry(&self, length: u32, shift: u32, absolute: bool) -> Result<&HuffmanNode, CgError> {
        self.get_entry(TableKind::Position, length, shift, absolute)
    }

    pub fn get_color_entry(&self, length: u32, shift: u32, absolute: bool) -> Result<&HuffmanNode, CgError> {
        self.get_entry(TableKind::Color, length, shift, absolute)
    }

    pub fn get_normal_entry(&self, length: u32, shift: u32, absolute: bool) -> Result<&HuffmanNode, CgError> {
        self.get_entry(TableKind::Normal, length, shift, absolute)
    }

    pub fn nodes(&self, kind: TableKind) -> &[HuffmanNode] {
        &self.table(kind).nodes
    }

    /// Emits one set-table command per tag of every table.
    pub fn output_commands(&self, output: &mut CommandStream) {
        for kind in TableKind::ALL {
            for node in self.nodes(kind) {
                let address = (1 << node.tag_length) | node.tag;
                let data_length = if node.data_length == 16 { 0 } else { node.data_length };
                let command = SET_TABLE | (kind.id() << 1) | (address >> 6);
                let body = (u64::from(address & 0x3F) << 9)
                    | (u64::from(data_length) << 5)
                    | if node.absolute { 0x10 } else { 0 }
                    | u64::from(node.shift);
                output.add_command(command, 8, body, 15);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn is_prefix(a: &HuffmanNode, b: &HuffmanNode) -> bool {
        a.tag_length <= b.tag_length && b.tag >> (b.tag_length - a.tag_length) == a.tag
    }

    #[test]
    fn test_single_entry_gets_one_bit_tag() {
        let mut table = HuffmanTable::new();
        table.add_position_entry(16, 0, true);
        table.compute_tags();
        let node = table.get_position_entry(16, 0, true).unwrap();
        assert_eq!(node.tag_length, 1);
        assert_eq!(node.tag, 0);
    }

    #[test]
    fn test_frequent_entries_get_shorter_tags() {
        let mut table = HuffmanTable::new();
        for _ in 0..100 {
            table.add_position_entry(4, 0, false);
        }
        for _ in 0..10 {
            table.add_position_entry(8, 0, false);
        }
        table.add_position_entry(16, 0, true);
        table.add_position_entry(12, 2, false);
        table.compute_tags();

        let common = table.get_position_entry(4, 0, false).unwrap();
        let rare = table.get_position_entry(16, 0, true).unwrap();
        assert_eq!(common.tag_length, 1);
        assert!(rare.tag_length >= common.tag_length);
    }

    #[test]
    fn test_lookup_before_build_is_an_error() {
        let mut table = HuffmanTable::new();
        table.add_color_entry(5, 0, true);
        assert!(table.get_color_entry(5, 0, true).is_err());
        table.compute_tags();
        assert!(table.get_color_entry(5, 0, true).is_ok());
        assert!(table.get_color_entry(6, 0, true).is_err());
    }

    #[test]
    fn test_skewed_distribution_is_bounded_to_six_bits() {
        let mut table = HuffmanTable::new();
        // Fibonacci frequencies force a degenerate tree of depth 23.
        let (mut a, mut b) = (1_u64, 1_u64);
        for length in 1..=12 {
            for shift in 0..2 {
                for _ in 0..a {
                    table.add_position_entry(length, shift, false);
                }
                let c = a + b;
                a = b;
                b = c;
            }
        }
        table.compute_tags();

        for length in 1..=12 {
            for shift in 0..2 {
                let node = table.get_position_entry(length, shift, false).unwrap();
                assert!(node.tag_length <= MAX_TAG_LENGTH);
                assert!(node.covers(length, shift));
            }
        }
    }

    #[test]
    fn test_set_table_commands() {
        let mut table = HuffmanTable::new();
        table.add_position_entry(16, 0, true);
        table.compute_tags();
        let mut output = CommandStream::new();
        table.output_commands(&mut output);
        assert_eq!(output.bit_length(), 23);
        let bytes = output.finish();
        // 00010 00 0 | 000010 0000 1 0000 + pad
        assert_eq!(bytes, vec![0b0001_0000, 0b0000_1000, 0b0010_0000]);
    }

    proptest! {
        #[test]
        fn tags_are_prefix_free(
            entries in prop::collection::vec((0u32..=16, 0u32..16, any::<bool>(), 1usize..40), 1..80)
        ) {
            let mut table = HuffmanTable::new();
            for &(length, shift, absolute, count) in &entries {
                for _ in 0..count {
                    table.add_position_entry(length, shift.min(16 - length.min(16)), absolute);
                }
            }
            table.compute_tags();

            let nodes = table.nodes(TableKind::Position);
            for (i, a) in nodes.iter().enumerate() {
                prop_assert!(a.tag_length >= 1 && a.tag_length <= MAX_TAG_LENGTH);
                for (j, b) in nodes.iter().enumerate() {
                    if i != j {
                        prop_assert!(!is_prefix(a, b), "{} prefixes {}", a.tag_string(), b.tag_string());
                    }
                }
            }
            for &(length, shift, absolute, _) in &entries {
                let shift = shift.min(16 - length.min(16));
                let node = table.get_position_entry(length, shift, absolute).unwrap();
                prop_assert_eq!(node.absolute, absolute);
                prop_assert!(node.covers(length, shift));
            }
        }
    }
}
