//! Bitstream parser producing vertices back from a compressed object.

use crate::command::{BitReader, COLOR_TABLE, NORMAL_TABLE, POSITION_TABLE, SUBCOMMAND_HEADER_LENGTH};
use crate::common::{from_fixed, length_mask, sign_extend, wrap_16, NORMAL_QUANT_MAX};
use crate::element::{MeshBuffer, MeshEntry};
use crate::error::CgError;
use crate::normal::{apply_normal_delta, dequantize_normal, QuantizedNormal, MAX_UV_ENTRIES};
use crate::stream::Normalization;
use crate::structures::{BufferType, CompressedGeometry, MeshFlag, StripFlag};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedVertex {
    /// Position in normalized space.
    pub position: [f32; 3],
    pub normal: Option<[f32; 3]>,
    /// RGBA; alpha is 1 when the stream carries three components.
    pub color: Option<[f32; 4]>,
    pub strip: StripFlag,
    pub mesh: MeshFlag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedGeometry {
    pub buffer_type: BufferType,
    pub vertices: Vec<DecodedVertex>,
}

impl DecodedGeometry {
    /// Replays the generalized strip flags into vertex index triples.
    pub fn triangles(&self) -> Vec<[usize; 3]> {
        let mut triangles = Vec::new();
        let mut window = [0; 2];
        let mut count = 0;
        let mut odd = false;
        for (i, vertex) in self.vertices.iter().enumerate() {
            if vertex.strip == StripFlag::Restart {
                window[0] = i;
                count = 1;
                odd = false;
                continue;
            }
            if count < 2 {
                window[count] = i;
                count += 1;
                continue;
            }
            let [a, b] = window;
            match vertex.strip {
                StripFlag::ReplaceMiddle => {
                    triangles.push([a, b, i]);
                    window[1] = i;
                }
                _ => {
                    triangles.push(if odd { [b, a, i] } else { [a, b, i] });
                    window = [b, i];
                    odd = !odd;
                }
            }
        }
        triangles
    }

    /// Segments between each non-restart vertex and the one before it.
    pub fn lines(&self) -> Vec<[usize; 2]> {
        self.vertices
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, v)| v.strip != StripFlag::Restart)
            .map(|(i, _)| [i - 1, i])
            .collect()
    }

    /// Moves every position back from normalized into model space.
    pub fn to_model_space(&mut self, normalization: &Normalization) {
        for vertex in &mut self.vertices {
            vertex.position = normalization.to_model_space(vertex.position);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TableEntry {
    tag_length: u32,
    data_length: u32,
    shift: u32,
    absolute: bool,
}

/// Data bits of one tagged command: first the ones packed after the tag,
/// then the ones in the body.
struct FieldReader {
    prefix: u32,
    prefix_bits: u32,
}

impl FieldReader {
    fn new(field: u32, entry: &TableEntry) -> Self {
        let prefix_bits = SUBCOMMAND_HEADER_LENGTH - entry.tag_length;
        FieldReader {
            prefix: field & length_mask(prefix_bits),
            prefix_bits,
        }
    }

    fn read(&mut self, reader: &mut BitReader, length: u32) -> Result<u32, CgError> {
        let from_prefix = length.min(self.prefix_bits);
        self.prefix_bits -= from_prefix;
        let mut value = (self.prefix >> self.prefix_bits) & length_mask(from_prefix);
        let rest = length - from_prefix;
        if rest > 0 {
            value = (value << rest) | reader.read(rest)? as u32;
        }
        Ok(value)
    }

    fn read_signed(&mut self, reader: &mut BitReader, entry: &TableEntry) -> Result<i32, CgError> {
        let bits = self.read(reader, entry.data_length)?;
        Ok(sign_extend(bits, entry.data_length) << entry.shift)
    }
}

struct Decoder<'a> {
    reader: BitReader<'a>,
    tables: [[Option<TableEntry>; 64]; 3],
    bundle_normals: bool,
    bundle_colors: bool,
    color_components: usize,
    position: [i32; 3],
    normal: Option<QuantizedNormal>,
    color: Option<[i32; 4]>,
    mesh_buffer: MeshBuffer<MeshEntry>,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Decoder {
            reader: BitReader::new(data),
            tables: [[None; 64]; 3],
            bundle_normals: false,
            bundle_colors: false,
            color_components: 3,
            position: [0; 3],
            normal: None,
            color: None,
            mesh_buffer: MeshBuffer::new(),
        }
    }

    fn lookup(&self, table: u32, field: u32) -> Result<TableEntry, CgError> {
        self.tables[table as usize][field as usize].ok_or_else(|| {
            CgError::Decode(format!("No table {} entry matches field {:#08b}", table, field))
        })
    }

    fn set_table(&mut self, header: u32) -> Result<(), CgError> {
        let table = (header >> 1) & 0x3;
        if table > NORMAL_TABLE {
            return Err(CgError::Decode(format!("Invalid table id {}", table)));
        }
        let body = self.reader.read(15)? as u32;
        let address = ((header & 1) << 6) | (body >> 9);
        if address == 0 {
            return Err(CgError::Decode("Set table command without a tag".to_string()));
        }
        let tag_length = 31 - address.leading_zeros();
        let tag = address & length_mask(tag_length);
        let mut data_length = (body >> 5) & 0xF;
        if data_length == 0 && table != NORMAL_TABLE {
            data_length = 16;
        }
        let entry = TableEntry {
            tag_length,
            data_length,
            shift: body & 0xF,
            absolute: body & 0x10 != 0,
        };

        let free_bits = SUBCOMMAND_HEADER_LENGTH - tag_length;
        let first = (tag << free_bits) as usize;
        for slot in &mut self.tables[table as usize][first..first + (1 << free_bits)] {
            *slot = Some(entry);
        }
        Ok(())
    }

    fn read_position(&mut self, field: u32) -> Result<(), CgError> {
        let entry = self.lookup(POSITION_TABLE, field)?;
        let mut data = FieldReader::new(field, &entry);
        for k in 0..3 {
            let value = data.read_signed(&mut self.reader, &entry)?;
            self.position[k] = if entry.absolute {
                value
            } else {
                wrap_16(self.position[k] + value)
            };
        }
        Ok(())
    }

    fn read_color(&mut self, field: u32) -> Result<(), CgError> {
        let entry = self.lookup(COLOR_TABLE, field)?;
        if !entry.absolute && self.color.is_none() {
            return Err(CgError::Decode("Relative color before any absolute one".to_string()));
        }
        let mut data = FieldReader::new(field, &entry);
        let mut color = self.color.unwrap_or_default();
        for value in color.iter_mut().take(self.color_components) {
            let component = data.read_signed(&mut self.reader, &entry)?;
            *value = if entry.absolute {
                component
            } else {
                wrap_16(*value + component)
            };
        }
        self.color = Some(color);
        Ok(())
    }

    fn read_normal(&mut self, field: u32) -> Result<(), CgError> {
        let entry = self.lookup(NORMAL_TABLE, field)?;
        let mut data = FieldReader::new(field, &entry);
        let normal = if entry.absolute {
            let codes = data.read(&mut self.reader, SUBCOMMAND_HEADER_LENGTH)?;
            let mut normal = QuantizedNormal {
                sextant: codes >> 3,
                octant: codes & 0x7,
                u: 0,
                v: 0,
            };
            if !normal.is_special() {
                normal.u = (data.read(&mut self.reader, entry.data_length)? << entry.shift) as i32;
                normal.v = (data.read(&mut self.reader, entry.data_length)? << entry.shift) as i32;
                if normal.u + normal.v > MAX_UV_ENTRIES {
                    return Err(CgError::Decode(format!(
                        "Normal grid index ({}, {}) is off the grid",
                        normal.u, normal.v
                    )));
                }
            }
            normal
        } else {
            let previous = self
                .normal
                .ok_or_else(|| CgError::Decode("Relative normal before any absolute one".to_string()))?;
            let du = data.read_signed(&mut self.reader, &entry)?;
            let dv = data.read_signed(&mut self.reader, &entry)?;
            apply_normal_delta(&previous, du, dv, MAX_UV_ENTRIES)?
        };
        self.normal = Some(normal);
        Ok(())
    }

    fn vertex(&self, strip: StripFlag, mesh: MeshFlag) -> Result<DecodedVertex, CgError> {
        let normal = match &self.normal {
            Some(n) => Some(dequantize_normal(n, NORMAL_QUANT_MAX)?),
            None => None,
        };
        Ok(DecodedVertex {
            position: self.position.map(from_fixed),
            normal,
            color: self.color.map(|c| {
                let mut color = c.map(from_fixed);
                if self.color_components == 3 {
                    color[3] = 1.0;
                }
                color
            }),
            strip,
            mesh,
        })
    }

    fn run(&mut self) -> Result<Vec<DecodedVertex>, CgError> {
        let mut vertices = Vec::new();
        while self.reader.remaining() >= 8 {
            let header = self.reader.read(8)? as u32;
            let field = header & 0x3F;
            match header >> 6 {
                0b11 => self.read_normal(field)?,
                0b10 => self.read_color(field)?,
                0b01 => {
                    self.read_position(field)?;
                    let strip = StripFlag::from_code(self.reader.read(2)? as u32)?;
                    let mesh = if self.reader.read(1)? == 1 {
                        MeshFlag::Push
                    } else {
                        MeshFlag::NoPush
                    };
                    if self.bundle_normals {
                        let field = self.reader.read(SUBCOMMAND_HEADER_LENGTH)? as u32;
                        self.read_normal(field)?;
                    }
                    if self.bundle_colors {
                        let field = self.reader.read(SUBCOMMAND_HEADER_LENGTH)? as u32;
                        self.read_color(field)?;
                    }
                    if mesh == MeshFlag::Push {
                        self.mesh_buffer.push(MeshEntry {
                            position: self.position,
                            normal: self.normal,
                            color: self.color,
                        });
                    }
                    vertices.push(self.vertex(strip, mesh)?);
                }
                _ if header & 0xE0 == 0x20 => {
                    let index = ((header >> 1) & 0xF) as usize;
                    let rep = ((header & 1) << 1) | self.reader.read(1)? as u32;
                    let strip = StripFlag::from_code(rep)?;
                    let entry = *self
                        .mesh_buffer
                        .get(index)
                        .ok_or(CgError::MeshBufferMiss(index))?;
                    self.position = entry.position;
                    if entry.normal.is_some() {
                        self.normal = entry.normal;
                    }
                    if entry.color.is_some() {
                        self.color = entry.color;
                    }
                    vertices.push(self.vertex(strip, MeshFlag::NoPush)?);
                }
                _ if header & 0xF8 == 0x18 => {
                    self.bundle_normals = header & 0x4 != 0;
                    self.bundle_colors = header & 0x2 != 0;
                    self.color_components = if header & 0x1 != 0 { 4 } else { 3 };
                }
                _ if header & 0xF8 == 0x10 => self.set_table(header)?,
                _ => {
                    return Err(CgError::Decode(format!("Unknown command header {:#04x}", header)));
                }
            }
        }
        Ok(vertices)
    }
}

pub struct GeometryDecompressor;

impl GeometryDecompressor {
    pub fn decompress(geometry: &CompressedGeometry) -> Result<DecodedGeometry, CgError> {
        let vertices = Decoder::new(&geometry.data).run()?;
        debug!(
            bytes = geometry.data.len(),
            vertices = vertices.len(),
            "decompressed geometry stream"
        );
        Ok(DecodedGeometry {
            buffer_type: geometry.header.buffer_type,
            vertices,
        })
    }
}
