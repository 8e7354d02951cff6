use crate::element::{ColorElement, Element, MeshBuffer, NormalElement, VertexElement};
use crate::error::CgError;
use crate::structures::{BufferType, MeshFlag, StripFlag, VertexFormat, MESH_BUFFER_SIZE};

/// Maps model space into the unit cube: `normalized = (p - center) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub center: [f32; 3],
    pub scale: f32,
}

impl Normalization {
    /// Centers the box on the origin and fits its largest extent into `[-1, 1]`.
    pub fn from_bounds(lower: [f32; 3], upper: [f32; 3]) -> Self {
        let center = std::array::from_fn(|k| (lower[k] + upper[k]) * 0.5);
        let extent = (0..3).map(|k| upper[k] - lower[k]).fold(0.0_f32, f32::max);
        let scale = if extent > 0.0 && extent.is_finite() {
            2.0 / extent
        } else {
            1.0
        };
        Normalization { center, scale }
    }

    pub fn to_model_space(&self, position: [f32; 3]) -> [f32; 3] {
        std::array::from_fn(|k| position[k] / self.scale + self.center[k])
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization {
            center: [0.0; 3],
            scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionOptions {
    pub position_bits: u32,
    pub color_bits: u32,
    pub normal_bits: u32,
    /// Derived from the stream's bounds when `None`.
    pub normalization: Option<Normalization>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        CompressionOptions {
            position_bits: 16,
            color_bits: 9,
            normal_bits: 6,
            normalization: None,
        }
    }
}

/// One input vertex. `color` holds RGBA; alpha is ignored unless the stream
/// format carries it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: Option<[f32; 3]>,
    pub color: Option<[f32; 4]>,
}

impl Vertex {
    pub fn new(position: [f32; 3]) -> Self {
        Vertex {
            position,
            ..Vertex::default()
        }
    }

    pub fn with_normal(mut self, normal: [f32; 3]) -> Self {
        self.normal = Some(normal);
        self
    }

    pub fn with_color(mut self, color: [f32; 4]) -> Self {
        self.color = Some(color);
        self
    }
}

/// An ordered list of geometry elements waiting to be compressed.
#[derive(Debug, Clone)]
pub struct CompressionStream {
    buffer_type: BufferType,
    format: VertexFormat,
    options: CompressionOptions,
    pub(crate) elements: Vec<Element>,
    vertex_count: usize,
    lower: [f32; 3],
    upper: [f32; 3],
    /// Mirror of the mesh buffer: `(call, index)` for vertices pushed by
    /// [`add_indexed_triangles`](Self::add_indexed_triangles), `None` for
    /// any other push.
    pushed: MeshBuffer<Option<(u64, usize)>>,
    indexed_calls: u64,
}

impl CompressionStream {
    pub fn new(buffer_type: BufferType, format: VertexFormat) -> Self {
        Self::with_options(buffer_type, format, CompressionOptions::default())
    }

    pub fn with_options(buffer_type: BufferType, format: VertexFormat, options: CompressionOptions) -> Self {
        CompressionStream {
            buffer_type,
            format,
            options,
            elements: Vec::new(),
            vertex_count: 0,
            lower: [f32::INFINITY; 3],
            upper: [f32::NEG_INFINITY; 3],
            pushed: MeshBuffer::new(),
            indexed_calls: 0,
        }
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn format(&self) -> VertexFormat {
        self.format
    }

    pub fn options(&self) -> &CompressionOptions {
        &self.options
    }

    /// Vertices and mesh buffer references added so far.
    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// Model-space bounds of every vertex added so far.
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        (self.vertex_count > 0 && self.lower[0] <= self.upper[0]).then_some((self.lower, self.upper))
    }

    /// The normalization the compressor will apply.
    pub fn normalization(&self) -> Normalization {
        match (self.options.normalization, self.bounds()) {
            (Some(normalization), _) => normalization,
            (None, Some((lower, upper))) => Normalization::from_bounds(lower, upper),
            (None, None) => Normalization::default(),
        }
    }

    pub fn add_vertex(&mut self, vertex: &Vertex, strip: StripFlag, mesh: MeshFlag) -> Result<(), CgError> {
        self.append_vertex(vertex, strip, mesh)?;
        if mesh == MeshFlag::Push {
            self.pushed.push(None);
        }
        Ok(())
    }

    fn append_vertex(&mut self, vertex: &Vertex, strip: StripFlag, mesh: MeshFlag) -> Result<(), CgError> {
        if vertex.normal.is_some() != self.format.normals {
            return Err(CgError::AttributeMismatch(format!(
                "stream {} normals but the vertex {} one",
                if self.format.normals { "bundles" } else { "has no" },
                if vertex.normal.is_some() { "has" } else { "lacks" },
            )));
        }
        if vertex.color.is_some() != self.format.colors {
            return Err(CgError::AttributeMismatch(format!(
                "stream {} colors but the vertex {} one",
                if self.format.colors { "bundles" } else { "has no" },
                if vertex.color.is_some() { "has" } else { "lacks" },
            )));
        }

        for k in 0..3 {
            self.lower[k] = self.lower[k].min(vertex.position[k]);
            self.upper[k] = self.upper[k].max(vertex.position[k]);
        }
        let components = self.format.color_components();
        self.elements.push(Element::Vertex(VertexElement::new(
            vertex.position,
            strip,
            mesh,
            vertex.normal.map(NormalElement::new),
            vertex.color.map(|c| ColorElement::new(c, components)),
        )));
        self.vertex_count += 1;
        Ok(())
    }

    /// A normal that applies to the vertices that follow.
    pub fn add_normal(&mut self, normal: [f32; 3]) {
        self.elements.push(Element::Normal(NormalElement::new(normal)));
    }

    /// A color that applies to the vertices that follow.
    pub fn add_color(&mut self, color: [f32; 4]) {
        let components = self.format.color_components();
        self.elements.push(Element::Color(ColorElement::new(color, components)));
    }

    /// Repeats the vertex pushed `index` pushes ago (0 = most recent).
    pub fn add_mesh_reference(&mut self, index: usize, strip: StripFlag) -> Result<(), CgError> {
        if index >= MESH_BUFFER_SIZE {
            return Err(CgError::MeshBufferMiss(index));
        }
        self.elements.push(Element::MeshReference { index, strip });
        self.vertex_count += 1;
        Ok(())
    }

    pub fn add_position_quant(&mut self, bits: u32) {
        self.elements.push(Element::PositionQuant(bits));
    }

    pub fn add_color_quant(&mut self, bits: u32) {
        self.elements.push(Element::ColorQuant(bits));
    }

    pub fn add_normal_quant(&mut self, bits: u32) {
        self.elements.push(Element::NormalQuant(bits));
    }

    pub fn add_points(&mut self, vertices: &[Vertex]) -> Result<(), CgError> {
        for vertex in vertices {
            self.add_vertex(vertex, StripFlag::Restart, MeshFlag::NoPush)?;
        }
        Ok(())
    }

    /// Independent segments from consecutive pairs; a trailing odd vertex is ignored.
    pub fn add_lines(&mut self, vertices: &[Vertex]) -> Result<(), CgError> {
        for pair in vertices.chunks_exact(2) {
            self.add_vertex(&pair[0], StripFlag::Restart, MeshFlag::NoPush)?;
            self.add_vertex(&pair[1], StripFlag::ReplaceOldest, MeshFlag::NoPush)?;
        }
        Ok(())
    }

    pub fn add_line_strip(&mut self, vertices: &[Vertex]) -> Result<(), CgError> {
        self.add_strip(vertices)
    }

    /// Independent triangles from consecutive triples.
    pub fn add_triangles(&mut self, vertices: &[Vertex]) -> Result<(), CgError> {
        for triangle in vertices.chunks_exact(3) {
            self.add_vertex(&triangle[0], StripFlag::Restart, MeshFlag::NoPush)?;
            self.add_vertex(&triangle[1], StripFlag::ReplaceOldest, MeshFlag::NoPush)?;
            self.add_vertex(&triangle[2], StripFlag::ReplaceOldest, MeshFlag::NoPush)?;
        }
        Ok(())
    }

    pub fn add_triangle_strip(&mut self, vertices: &[Vertex]) -> Result<(), CgError> {
        self.add_strip(vertices)
    }

    fn add_strip(&mut self, vertices: &[Vertex]) -> Result<(), CgError> {
        for (i, vertex) in vertices.iter().enumerate() {
            let strip = if i == 0 {
                StripFlag::Restart
            } else {
                StripFlag::ReplaceOldest
            };
            self.add_vertex(vertex, strip, MeshFlag::NoPush)?;
        }
        Ok(())
    }

    /// Indexed triangles. Every vertex sent in full is pushed into the mesh
    /// buffer, and corners whose index was pushed by this same call and is
    /// still buffered become references.
    pub fn add_indexed_triangles(&mut self, vertices: &[Vertex], indices: &[u32]) -> Result<(), CgError> {
        let call = self.indexed_calls;
        self.indexed_calls += 1;
        let flags = [StripFlag::Restart, StripFlag::ReplaceOldest, StripFlag::ReplaceOldest];
        for triangle in indices.chunks_exact(3) {
            for (&index, strip) in triangle.iter().zip(flags) {
                let index = index as usize;
                let vertex = vertices.get(index).ok_or(CgError::IndexOutOfRange {
                    index,
                    count: vertices.len(),
                })?;
                match self.pushed.position(|&pushed| pushed == Some((call, index))) {
                    Some(slot) => self.add_mesh_reference(slot, strip)?,
                    None => {
                        self.append_vertex(vertex, strip, MeshFlag::Push)?;
                        self.pushed.push(Some((call, index)));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::GeometryCompressor;
    use crate::decompressor::GeometryDecompressor;

    fn grid() -> Vec<Vertex> {
        vec![
            Vertex::new([0.0, 0.0, 0.0]),
            Vertex::new([1.0, 0.0, 0.0]),
            Vertex::new([0.0, 1.0, 0.0]),
            Vertex::new([1.0, 1.0, 0.0]),
        ]
    }

    #[test]
    fn test_attribute_mismatch_is_rejected() {
        let mut stream = CompressionStream::new(BufferType::Triangle, VertexFormat::POSITION.with_normals());
        let bare = Vertex::new([0.0; 3]);
        assert!(matches!(
            stream.add_vertex(&bare, StripFlag::Restart, MeshFlag::NoPush),
            Err(CgError::AttributeMismatch(_))
        ));
        let colored = bare.with_normal([0.0, 0.0, 1.0]).with_color([1.0; 4]);
        assert!(stream.add_vertex(&colored, StripFlag::Restart, MeshFlag::NoPush).is_err());
        assert_eq!(stream.vertex_count(), 0);
        let good = bare.with_normal([0.0, 0.0, 1.0]);
        assert!(stream.add_vertex(&good, StripFlag::Restart, MeshFlag::NoPush).is_ok());
        assert_eq!(stream.vertex_count(), 1);
    }

    #[test]
    fn test_normalization_from_bounds() {
        let n = Normalization::from_bounds([-1.0, 0.0, 2.0], [3.0, 1.0, 2.0]);
        assert_eq!(n.center, [1.0, 0.5, 2.0]);
        assert_eq!(n.scale, 0.5);
        assert_eq!(n.to_model_space([1.0, 0.0, 0.0]), [3.0, 0.5, 2.0]);

        let flat = Normalization::from_bounds([2.0; 3], [2.0; 3]);
        assert_eq!(flat.scale, 1.0);
    }

    #[test]
    fn test_explicit_normalization_wins() {
        let explicit = Normalization {
            center: [0.0; 3],
            scale: 0.25,
        };
        let options = CompressionOptions {
            normalization: Some(explicit),
            ..CompressionOptions::default()
        };
        let mut stream = CompressionStream::with_options(BufferType::Point, VertexFormat::POSITION, options);
        stream.add_points(&grid()).unwrap();
        assert_eq!(stream.normalization(), explicit);
        assert_eq!(stream.bounds(), Some(([0.0; 3], [1.0, 1.0, 0.0])));
    }

    #[test]
    fn test_indexed_triangles_reuse_buffered_vertices() {
        let mut stream = CompressionStream::new(BufferType::Triangle, VertexFormat::POSITION);
        stream.add_indexed_triangles(&grid(), &[0, 1, 2, 2, 1, 3]).unwrap();
        assert_eq!(stream.vertex_count(), 6);

        let references: Vec<(usize, StripFlag)> = stream
            .elements
            .iter()
            .filter_map(|e| match e {
                Element::MeshReference { index, strip } => Some((*index, *strip)),
                _ => None,
            })
            .collect();
        // After pushing 0, 1, 2 the buffer is [2, 1, 0].
        assert_eq!(
            references,
            vec![(0, StripFlag::Restart), (1, StripFlag::ReplaceOldest)]
        );
    }

    fn identity_stream() -> CompressionStream {
        let options = CompressionOptions {
            normalization: Some(Normalization::default()),
            ..CompressionOptions::default()
        };
        CompressionStream::with_options(BufferType::Triangle, VertexFormat::POSITION, options)
    }

    fn decoded_positions(stream: &mut CompressionStream) -> Vec<[f32; 3]> {
        let geometry = GeometryCompressor::new().compress(stream).unwrap();
        GeometryDecompressor::decompress(&geometry)
            .unwrap()
            .vertices
            .iter()
            .map(|v| v.position)
            .collect()
    }

    #[test]
    fn test_manual_push_between_indexed_calls() {
        let vertices: Vec<Vertex> = [[0.0, 0.0, 0.0], [0.5, 0.0, 0.0], [0.0, 0.5, 0.0]]
            .into_iter()
            .map(Vertex::new)
            .collect();
        let mut stream = identity_stream();
        stream.add_indexed_triangles(&vertices, &[0, 1, 2]).unwrap();
        stream
            .add_vertex(&Vertex::new([-0.5; 3]), StripFlag::Restart, MeshFlag::Push)
            .unwrap();
        stream.add_indexed_triangles(&vertices, &[2, 1, 0]).unwrap();
        assert_eq!(stream.vertex_count(), 7);

        assert_eq!(
            decoded_positions(&mut stream),
            vec![
                [0.0, 0.0, 0.0],
                [0.5, 0.0, 0.0],
                [0.0, 0.5, 0.0],
                [-0.5, -0.5, -0.5],
                [0.0, 0.5, 0.0],
                [0.5, 0.0, 0.0],
                [0.0, 0.0, 0.0],
            ]
        );
    }

    #[test]
    fn test_indices_do_not_carry_across_calls() {
        let first: Vec<Vertex> = [[0.0, 0.0, 0.0], [0.5, 0.0, 0.0], [0.0, 0.5, 0.0]]
            .into_iter()
            .map(Vertex::new)
            .collect();
        let second: Vec<Vertex> = [[0.25, 0.25, 0.0], [-0.5, 0.25, 0.0], [0.25, -0.5, 0.5]]
            .into_iter()
            .map(Vertex::new)
            .collect();
        let mut stream = identity_stream();
        stream.add_indexed_triangles(&first, &[0, 1, 2]).unwrap();
        stream.add_indexed_triangles(&second, &[0, 1, 2, 2, 1, 0]).unwrap();

        let references: Vec<usize> = stream
            .elements
            .iter()
            .filter_map(|e| match e {
                Element::MeshReference { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        // Only the second triangle of the second call reuses slots.
        assert_eq!(references, vec![0, 1, 2]);

        let positions = decoded_positions(&mut stream);
        assert_eq!(positions.len(), 9);
        assert_eq!(positions[3..6], [second[0].position, second[1].position, second[2].position]);
        assert_eq!(positions[6..9], [second[2].position, second[1].position, second[0].position]);
    }

    #[test]
    fn test_indexed_triangles_reject_bad_index() {
        let mut stream = CompressionStream::new(BufferType::Triangle, VertexFormat::POSITION);
        assert!(matches!(
            stream.add_indexed_triangles(&grid(), &[0, 1, 9]),
            Err(CgError::IndexOutOfRange { index: 9, count: 4 })
        ));
    }

    #[test]
    fn test_mesh_reference_beyond_buffer_is_rejected() {
        let mut stream = CompressionStream::new(BufferType::Triangle, VertexFormat::POSITION);
        assert!(stream.add_mesh_reference(15, StripFlag::Restart).is_ok());
        assert!(matches!(
            stream.add_mesh_reference(16, StripFlag::Restart),
            Err(CgError::MeshBufferMiss(16))
        ));
    }
}
