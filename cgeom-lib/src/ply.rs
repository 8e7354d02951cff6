//! Minimal binary little-endian PLY reader and writer for triangle meshes.

use crate::error::CgError;
use foldhash::{HashMap, HashMapExt};
use std::io::Write;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Mesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    /// RGBA in `[0, 1]`; alpha is 1 when the file has none.
    pub colors: Option<Vec<[f32; 4]>>,
    pub alpha: bool,
    pub faces: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }
}

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            let line = &buffer[start..start + pos];
            Some(line.strip_suffix(b"\r").unwrap_or(line))
        }
        None => {
            *offset = buffer.len();
            Some(&buffer[start..])
        }
    }
}

fn parse_count(line: &[u8], prefix: &[u8]) -> Result<usize, CgError> {
    let s = std::str::from_utf8(&line[prefix.len()..])
        .map_err(|e| CgError::ParsePly(format!("UTF-8 error: {}", e)))?
        .trim();
    s.parse()
        .map_err(|e| CgError::ParsePly(format!("Parse error in {:?}: {}", s, e)))
}

#[inline(always)]
fn bytes_to_f32(data: &[u8], field_name: &str) -> Result<f32, CgError> {
    Ok(f32::from_le_bytes(data.try_into().map_err(|e| {
        CgError::ParsePly(format!("Byte conversion error for {}: {}", field_name, e))
    })?))
}

struct Fields<'h> {
    map: HashMap<&'h str, usize>,
}

impl Fields<'_> {
    fn get(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }

    fn require(&self, name: &str) -> Result<usize, CgError> {
        self.get(name)
            .ok_or_else(|| CgError::ParsePly(format!("Missing required field: {}", name)))
    }

    /// All of `names`, or none of them.
    fn group<const N: usize>(&self, names: [&str; N]) -> Result<Option<[usize; N]>, CgError> {
        let found = names.map(|name| self.get(name));
        match found.iter().filter(|i| i.is_some()).count() {
            0 => Ok(None),
            n if n == N => Ok(Some(found.map(|i| i.unwrap_or_default()))),
            _ => Err(CgError::ParsePly(format!("Incomplete field group {:?}", names))),
        }
    }
}

/// Parses a mesh with `float` vertex properties and an optional face list.
/// Polygons with more than three corners are split into a fan.
#[inline(never)]
pub fn parse_mesh(raw_data: &[u8]) -> Result<Mesh, CgError> {
    let mut offset = 0;

    let line = next_line(raw_data, &mut offset)
        .ok_or_else(|| CgError::ParsePly("No 'ply' line".to_string()))?;
    if line != b"ply" {
        return Err(CgError::ParsePly(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    let line = next_line(raw_data, &mut offset)
        .ok_or_else(|| CgError::ParsePly("Missing format line".to_string()))?;
    if line != b"format binary_little_endian 1.0" {
        return Err(CgError::ParsePly(
            "Unsupported .ply format (only binary_little_endian 1.0 is supported)".to_string(),
        ));
    }

    let mut vertex_count = None;
    let mut face_count = 0;
    let mut in_faces = false;
    let mut field_names: Vec<&str> = Vec::new();
    loop {
        let line = next_line(raw_data, &mut offset)
            .ok_or_else(|| CgError::ParsePly("No 'end_header' found before EOF".to_string()))?;

        if line.starts_with(b"end_header") {
            break;
        } else if line.starts_with(b"comment") || line.starts_with(b"obj_info") {
            continue;
        } else if line.starts_with(b"element vertex ") {
            vertex_count = Some(parse_count(line, b"element vertex ")?);
            in_faces = false;
        } else if line.starts_with(b"element face ") {
            face_count = parse_count(line, b"element face ")?;
            in_faces = true;
        } else if !in_faces && line.starts_with(b"property float ") {
            let name = std::str::from_utf8(&line[b"property float ".len()..])
                .map_err(|e| CgError::ParsePly(format!("UTF-8 error in field name: {}", e)))?;
            field_names.push(name.trim());
        } else if in_faces && line.starts_with(b"property list uchar ") {
            let rest = &line[b"property list uchar ".len()..];
            if !(rest.starts_with(b"int ") || rest.starts_with(b"uint ")) {
                return Err(CgError::ParsePly(
                    "Face indices must be 32-bit integers".to_string(),
                ));
            }
        } else {
            return Err(CgError::ParsePly(format!(
                "Unsupported header line: {:?}",
                String::from_utf8_lossy(line)
            )));
        }
    }
    let vertex_count =
        vertex_count.ok_or_else(|| CgError::ParsePly("Missing 'element vertex' definition".to_string()))?;

    let mut map = HashMap::with_capacity(field_names.len());
    for (i, &name) in field_names.iter().enumerate() {
        map.insert(name, i);
    }
    let fields = Fields { map };
    let position = [fields.require("x")?, fields.require("y")?, fields.require("z")?];
    let normal = fields.group(["nx", "ny", "nz"])?;
    let color = fields.group(["red", "green", "blue"])?;
    let alpha = fields.get("alpha");

    let stride = field_names.len() * 4;
    let expected_bytes = vertex_count
        .checked_mul(stride)
        .ok_or_else(|| CgError::ParsePly("Overflow in byte calculation".to_string()))?;
    if raw_data.len() < offset + expected_bytes {
        return Err(CgError::ParsePly(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected_bytes,
            raw_data.len() - offset
        )));
    }

    let mut mesh = Mesh {
        positions: Vec::with_capacity(vertex_count),
        normals: normal.map(|_| Vec::with_capacity(vertex_count)),
        colors: color.map(|_| Vec::with_capacity(vertex_count)),
        alpha: color.is_some() && alpha.is_some(),
        faces: Vec::new(),
    };

    let read = |vertex: &[u8], index: usize, name: &str| bytes_to_f32(&vertex[index * 4..index * 4 + 4], name);
    for vertex in raw_data[offset..offset + expected_bytes].chunks_exact(stride.max(1)) {
        mesh.positions.push([
            read(vertex, position[0], "x")?,
            read(vertex, position[1], "y")?,
            read(vertex, position[2], "z")?,
        ]);
        if let (Some(normals), Some(n)) = (mesh.normals.as_mut(), normal) {
            normals.push([read(vertex, n[0], "nx")?, read(vertex, n[1], "ny")?, read(vertex, n[2], "nz")?]);
        }
        if let (Some(colors), Some(c)) = (mesh.colors.as_mut(), color) {
            let a = match alpha {
                Some(a) => read(vertex, a, "alpha")?,
                None => 1.0,
            };
            colors.push([read(vertex, c[0], "red")?, read(vertex, c[1], "green")?, read(vertex, c[2], "blue")?, a]);
        }
    }
    offset += expected_bytes;

    for _ in 0..face_count {
        let corners = *raw_data
            .get(offset)
            .ok_or_else(|| CgError::ParsePly("Unexpected end of face data".to_string()))?
            as usize;
        offset += 1;
        let bytes = raw_data
            .get(offset..offset + corners * 4)
            .ok_or_else(|| CgError::ParsePly("Unexpected end of face data".to_string()))?;
        offset += corners * 4;

        let indices: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(CgError::ParsePly(format!(
                "Face index {} exceeds vertex count {}",
                bad, vertex_count
            )));
        }
        for k in 2..indices.len() {
            mesh.faces.push([indices[0], indices[k - 1], indices[k]]);
        }
    }

    Ok(mesh)
}

/// Writes `mesh` in the dialect [`parse_mesh`] reads.
pub fn write_mesh(mesh: &Mesh, output: &mut Vec<u8>) -> Result<(), CgError> {
    output.clear();
    output.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
    writeln!(output, "element vertex {}", mesh.positions.len())?;
    output.extend_from_slice(b"property float x\nproperty float y\nproperty float z\n");
    if mesh.normals.is_some() {
        output.extend_from_slice(b"property float nx\nproperty float ny\nproperty float nz\n");
    }
    if mesh.colors.is_some() {
        output.extend_from_slice(b"property float red\nproperty float green\nproperty float blue\n");
        if mesh.alpha {
            output.extend_from_slice(b"property float alpha\n");
        }
    }
    if !mesh.faces.is_empty() {
        writeln!(output, "element face {}", mesh.faces.len())?;
        output.extend_from_slice(b"property list uchar int vertex_indices\n");
    }
    output.extend_from_slice(b"end_header\n");

    for (i, position) in mesh.positions.iter().enumerate() {
        let mut values: Vec<f32> = position.to_vec();
        if let Some(normals) = &mesh.normals {
            values.extend_from_slice(normals.get(i).unwrap_or(&[0.0; 3]));
        }
        if let Some(colors) = &mesh.colors {
            let color = colors.get(i).copied().unwrap_or([1.0; 4]);
            let components = if mesh.alpha { 4 } else { 3 };
            values.extend_from_slice(&color[..components]);
        }
        for value in values {
            output.extend_from_slice(&value.to_le_bytes());
        }
    }

    for face in &mesh.faces {
        output.push(3);
        for index in face {
            output.extend_from_slice(&index.to_le_bytes());
        }
    }
    Ok(())
}
