//! Stream elements and the quantizer state threaded through them.
//!
//! Compression is two passes over the same element list. The first pass calls
//! [`Element::quantize`] in stream order, which fixes every element's
//! `(length, shift, absolute)` profile and tallies it in the Huffman table.
//! The second pass calls [`Element::output`] once tags are assigned.

use crate::command::{CommandStream, MESH_B_R, SET_COLOR, SET_NORM, SUBCOMMAND_HEADER_LENGTH, VERTEX};
use crate::common::{
    clamp_quant, compute_length_shift, compute_unsigned_length_shift, length_mask,
    quantization_mask, to_fixed, wrap_16, COLOR_QUANT_MAX, COLOR_QUANT_MIN, FIXED_MAX,
    NORMAL_QUANT_MAX, NORMAL_QUANT_MIN, POSITION_QUANT_MAX, POSITION_QUANT_MIN,
};
use crate::error::CgError;
use crate::huffman::{HuffmanNode, HuffmanTable, TableKind};
use crate::normal::{normal_delta, quantize_normal, QuantizedNormal, MAX_UV_ENTRIES};
use crate::stream::Normalization;
use crate::structures::{MeshFlag, StripFlag, MESH_BUFFER_SIZE};
use std::collections::VecDeque;
use tracing::debug;

/// FIFO of the most recently pushed vertices. Index 0 is the newest entry.
#[derive(Debug, Clone)]
pub(crate) struct MeshBuffer<T> {
    entries: VecDeque<T>,
}

impl<T> MeshBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(MESH_BUFFER_SIZE),
        }
    }

    pub(crate) fn push(&mut self, entry: T) {
        if self.entries.len() == MESH_BUFFER_SIZE {
            self.entries.pop_back();
        }
        self.entries.push_front(entry);
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)
    }

    pub(crate) fn position(&self, predicate: impl FnMut(&T) -> bool) -> Option<usize> {
        self.entries.iter().position(predicate)
    }
}

/// Quantized attributes of a pushed vertex, as both encoder and decoder see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MeshEntry {
    pub position: [i32; 3],
    pub normal: Option<QuantizedNormal>,
    pub color: Option<[i32; 4]>,
}

/// The transmitted form of one attribute value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Encoded {
    /// Sextant and octant of an absolute normal.
    pub prefix: Option<u32>,
    pub values: [i32; 4],
    pub count: usize,
    pub length: u32,
    pub shift: u32,
    pub absolute: bool,
}

impl Encoded {
    /// Position and color profile; a field is never narrower than one bit.
    fn signed(values: &[i32], absolute: bool) -> Self {
        let (length, shift) = match compute_length_shift(values) {
            (0, _) => (1, 0),
            profile => profile,
        };
        let mut encoded = Encoded {
            length,
            shift,
            absolute,
            count: values.len(),
            ..Encoded::default()
        };
        encoded.values[..values.len()].copy_from_slice(values);
        encoded
    }

    fn node<'t>(&self, table: &'t HuffmanTable, kind: TableKind) -> Result<&'t HuffmanNode, CgError> {
        table.get_entry(kind, self.length, self.shift, self.absolute)
    }

    /// Data bits laid out with the node's field width and shift, and their count.
    fn data(&self, node: &HuffmanNode) -> (u64, u32) {
        let mut bits = 0_u64;
        let mut length = 0;
        if let Some(prefix) = self.prefix {
            bits = u64::from(prefix);
            length = SUBCOMMAND_HEADER_LENGTH;
        }
        let mask = length_mask(node.data_length);
        for value in &self.values[..self.count] {
            let field = ((value >> node.shift) as u32) & mask;
            bits = (bits << node.data_length) | u64::from(field);
            length += node.data_length;
        }
        (bits, length)
    }
}

#[inline]
fn body_mask(length: u32) -> u64 {
    if length >= 64 {
        u64::MAX
    } else {
        (1 << length) - 1
    }
}

/// Writes a tagged command: the tag and as many leading data bits as fit go
/// in the 6-bit field (after `opcode` when there is one), the rest in the body.
fn emit(output: &mut CommandStream, opcode: Option<u32>, node: &HuffmanNode, data: u64, data_length: u32) {
    let field_bits = SUBCOMMAND_HEADER_LENGTH - node.tag_length;
    let (head, body, body_length) = if data_length >= field_bits {
        let body_length = data_length - field_bits;
        let head = data.checked_shr(body_length).unwrap_or(0) as u32;
        (head, data & body_mask(body_length), body_length)
    } else {
        ((data << (field_bits - data_length)) as u32, 0, 0)
    };
    let field = (node.tag << field_bits) | head;
    match opcode {
        Some(opcode) => output.add_command(opcode | field, 8, body, body_length),
        None => output.add_command(field, SUBCOMMAND_HEADER_LENGTH, body, body_length),
    }
}

fn clamp_bits(attribute: &str, requested: u32, min: u32, max: u32) -> u32 {
    let bits = clamp_quant(requested, min, max);
    if bits != requested {
        debug!(attribute, requested, clamped = bits, "quantization precision clamped");
    }
    bits
}

/// Per-stream accumulator mutated by the quantization pass.
#[derive(Debug)]
pub(crate) struct QuantizerState {
    center: [f64; 3],
    scale: f64,
    position_quant: u32,
    color_quant: u32,
    normal_quant: u32,
    position_quant_changed: bool,
    color_quant_changed: bool,
    normal_quant_changed: bool,
    last_position: Option<[i32; 3]>,
    last_color: Option<[i32; 4]>,
    last_normal: Option<QuantizedNormal>,
    lower: [i32; 3],
    upper: [i32; 3],
    mesh_buffer: MeshBuffer<MeshEntry>,
}

impl QuantizerState {
    pub(crate) fn new(normalization: &Normalization, position_bits: u32, color_bits: u32, normal_bits: u32) -> Self {
        QuantizerState {
            center: normalization.center.map(f64::from),
            scale: f64::from(normalization.scale),
            position_quant: clamp_bits("position", position_bits, POSITION_QUANT_MIN, POSITION_QUANT_MAX),
            color_quant: clamp_bits("color", color_bits, COLOR_QUANT_MIN, COLOR_QUANT_MAX),
            normal_quant: clamp_bits("normal", normal_bits, NORMAL_QUANT_MIN, NORMAL_QUANT_MAX),
            position_quant_changed: false,
            color_quant_changed: false,
            normal_quant_changed: false,
            last_position: None,
            last_color: None,
            last_normal: None,
            lower: [i32::MAX; 3],
            upper: [i32::MIN; 3],
            mesh_buffer: MeshBuffer::new(),
        }
    }

    pub(crate) fn position_quant(&self) -> u32 {
        self.position_quant
    }

    pub(crate) fn set_position_quant(&mut self, bits: u32) {
        let bits = clamp_bits("position", bits, POSITION_QUANT_MIN, POSITION_QUANT_MAX);
        if bits != self.position_quant {
            self.position_quant = bits;
            self.position_quant_changed = true;
        }
    }

    pub(crate) fn set_color_quant(&mut self, bits: u32) {
        let bits = clamp_bits("color", bits, COLOR_QUANT_MIN, COLOR_QUANT_MAX);
        if bits != self.color_quant {
            self.color_quant = bits;
            self.color_quant_changed = true;
        }
    }

    pub(crate) fn set_normal_quant(&mut self, bits: u32) {
        let bits = clamp_bits("normal", bits, NORMAL_QUANT_MIN, NORMAL_QUANT_MAX);
        if bits != self.normal_quant {
            self.normal_quant = bits;
            self.normal_quant_changed = true;
        }
    }

    /// Quantized bounds of every position seen so far.
    pub(crate) fn bounds(&self) -> Option<([i32; 3], [i32; 3])> {
        self.last_position.map(|_| (self.lower, self.upper))
    }

    fn quantize_position(&mut self, position: [f32; 3]) -> Encoded {
        let mask = quantization_mask(self.position_quant);
        let q: [i32; 3] = std::array::from_fn(|k| {
            to_fixed((f64::from(position[k]) - self.center[k]) * self.scale) & mask
        });
        for k in 0..3 {
            self.lower[k] = self.lower[k].min(q[k]);
            self.upper[k] = self.upper[k].max(q[k]);
        }

        let encoded = match self.last_position {
            Some(last) if !self.position_quant_changed => {
                let delta: [i32; 3] = std::array::from_fn(|k| wrap_16(q[k] - last[k]));
                Encoded::signed(&delta, false)
            }
            _ => Encoded::signed(&q, true),
        };
        self.last_position = Some(q);
        self.position_quant_changed = false;
        encoded
    }

    fn quantize_color(&mut self, color: [f32; 4], components: usize) -> Encoded {
        let mask = quantization_mask(self.color_quant);
        let mut q = [0; 4];
        for k in 0..components {
            q[k] = to_fixed(f64::from(color[k])).clamp(0, FIXED_MAX) & mask;
        }

        let encoded = match self.last_color {
            Some(last) if !self.color_quant_changed => {
                let delta: [i32; 4] = std::array::from_fn(|k| wrap_16(q[k] - last[k]));
                Encoded::signed(&delta[..components], false)
            }
            _ => Encoded::signed(&q[..components], true),
        };
        self.last_color = Some(q);
        self.color_quant_changed = false;
        encoded
    }

    fn quantize_normal(&mut self, normal: [f32; 3]) -> Encoded {
        let q = quantize_normal(normal, self.normal_quant).to_finest(self.normal_quant);
        let delta = match self.last_normal {
            Some(last) if !self.normal_quant_changed => normal_delta(&last, &q, MAX_UV_ENTRIES),
            _ => None,
        };

        let encoded = match delta {
            Some((du, dv)) => {
                let (length, shift) = compute_length_shift(&[du, dv]);
                Encoded {
                    values: [du, dv, 0, 0],
                    count: 2,
                    length,
                    shift,
                    absolute: false,
                    prefix: None,
                }
            }
            None if q.is_special() => Encoded {
                prefix: Some((q.sextant << 3) | q.octant),
                absolute: true,
                ..Encoded::default()
            },
            None => {
                let (length, shift) = compute_unsigned_length_shift(&[q.u, q.v]);
                Encoded {
                    prefix: Some((q.sextant << 3) | q.octant),
                    values: [q.u, q.v, 0, 0],
                    count: 2,
                    length: length.min(NORMAL_QUANT_MAX),
                    shift,
                    absolute: true,
                }
            }
        };
        self.last_normal = Some(q);
        self.normal_quant_changed = false;
        encoded
    }

    fn push_mesh_entry(&mut self) {
        if let Some(position) = self.last_position {
            self.mesh_buffer.push(MeshEntry {
                position,
                normal: self.last_normal,
                color: self.last_color,
            });
        }
    }

    fn restore_mesh_entry(&mut self, index: usize) -> Result<(), CgError> {
        let entry = *self
            .mesh_buffer
            .get(index)
            .ok_or(CgError::MeshBufferMiss(index))?;
        self.last_position = Some(entry.position);
        if entry.normal.is_some() {
            self.last_normal = entry.normal;
        }
        if entry.color.is_some() {
            self.last_color = entry.color;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NormalElement {
    pub normal: [f32; 3],
    encoded: Encoded,
}

impl NormalElement {
    pub(crate) fn new(normal: [f32; 3]) -> Self {
        Self {
            normal,
            encoded: Encoded::default(),
        }
    }

    fn quantize(&mut self, state: &mut QuantizerState, table: &mut HuffmanTable) {
        self.encoded = state.quantize_normal(self.normal);
        let e = &self.encoded;
        table.add_normal_entry(e.length, e.shift, e.absolute);
    }

    fn output(&self, opcode: Option<u32>, table: &HuffmanTable, output: &mut CommandStream) -> Result<(), CgError> {
        let node = self.encoded.node(table, TableKind::Normal)?;
        let (data, length) = self.encoded.data(node);
        emit(output, opcode, node, data, length);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ColorElement {
    pub color: [f32; 4],
    pub components: usize,
    encoded: Encoded,
}

impl ColorElement {
    pub(crate) fn new(color: [f32; 4], components: usize) -> Self {
        Self {
            color,
            components,
            encoded: Encoded::default(),
        }
    }

    fn quantize(&mut self, state: &mut QuantizerState, table: &mut HuffmanTable) {
        self.encoded = state.quantize_color(self.color, self.components);
        let e = &self.encoded;
        table.add_color_entry(e.length, e.shift, e.absolute);
    }

    fn output(&self, opcode: Option<u32>, table: &HuffmanTable, output: &mut CommandStream) -> Result<(), CgError> {
        let node = self.encoded.node(table, TableKind::Color)?;
        let (data, length) = self.encoded.data(node);
        emit(output, opcode, node, data, length);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct VertexElement {
    pub position: [f32; 3],
    pub strip: StripFlag,
    pub mesh: MeshFlag,
    pub normal: Option<NormalElement>,
    pub color: Option<ColorElement>,
    encoded: Encoded,
}

impl VertexElement {
    pub(crate) fn new(
        position: [f32; 3],
        strip: StripFlag,
        mesh: MeshFlag,
        normal: Option<NormalElement>,
        color: Option<ColorElement>,
    ) -> Self {
        Self {
            position,
            strip,
            mesh,
            normal,
            color,
            encoded: Encoded::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Element {
    Vertex(VertexElement),
    Normal(NormalElement),
    Color(ColorElement),
    MeshReference { index: usize, strip: StripFlag },
    PositionQuant(u32),
    ColorQuant(u32),
    NormalQuant(u32),
}

impl Element {
    /// Fixes this element's transmitted form and registers its profile.
    pub(crate) fn quantize(&mut self, state: &mut QuantizerState, table: &mut HuffmanTable) -> Result<(), CgError> {
        match self {
            Element::Vertex(vertex) => {
                vertex.encoded = state.quantize_position(vertex.position);
                let e = &vertex.encoded;
                table.add_position_entry(e.length, e.shift, e.absolute);
                if let Some(normal) = vertex.normal.as_mut() {
                    normal.quantize(state, table);
                }
                if let Some(color) = vertex.color.as_mut() {
                    color.quantize(state, table);
                }
                if vertex.mesh == MeshFlag::Push {
                    state.push_mesh_entry();
                }
            }
            Element::Normal(normal) => normal.quantize(state, table),
            Element::Color(color) => color.quantize(state, table),
            Element::MeshReference { index, .. } => state.restore_mesh_entry(*index)?,
            Element::PositionQuant(bits) => state.set_position_quant(*bits),
            Element::ColorQuant(bits) => state.set_color_quant(*bits),
            Element::NormalQuant(bits) => state.set_normal_quant(*bits),
        }
        Ok(())
    }

    /// Emits this element's command bits. Precision changes emit nothing: the
    /// stream carries every field's width and shift in its Huffman tags.
    pub(crate) fn output(&self, table: &HuffmanTable, output: &mut CommandStream) -> Result<(), CgError> {
        match self {
            Element::Vertex(vertex) => {
                let node = vertex.encoded.node(table, TableKind::Position)?;
                let (data, length) = vertex.encoded.data(node);
                emit(output, Some(VERTEX), node, data, length);
                let mesh = u32::from(vertex.mesh == MeshFlag::Push);
                output.add_command((vertex.strip.code() << 1) | mesh, 3, 0, 0);
                if let Some(normal) = &vertex.normal {
                    normal.output(None, table, output)?;
                }
                if let Some(color) = &vertex.color {
                    color.output(None, table, output)?;
                }
            }
            Element::Normal(normal) => normal.output(Some(SET_NORM), table, output)?,
            Element::Color(color) => color.output(Some(SET_COLOR), table, output)?,
            Element::MeshReference { index, strip } => {
                let rep = strip.code();
                let header = MESH_B_R | ((*index as u32) << 1) | (rep >> 1);
                output.add_command(header, 8, u64::from(rep & 1), 1);
            }
            Element::PositionQuant(_) | Element::ColorQuant(_) | Element::NormalQuant(_) => {}
        }
        Ok(())
    }
}
