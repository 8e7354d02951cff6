pub mod command;
pub mod common;
pub mod compressor;
pub mod decompressor;
mod element;
pub mod error;
pub mod file;
pub mod huffman;
pub mod normal;
pub mod ply;
pub mod stream;
pub mod structures;

pub use compressor::GeometryCompressor;
pub use decompressor::{DecodedGeometry, DecodedVertex, GeometryDecompressor};
pub use error::CgError;
pub use file::CompressedGeometryFile;
pub use ply::Mesh;
pub use stream::{CompressionOptions, CompressionStream, Normalization, Vertex};
pub use structures::{
    BufferType, CompressedGeometry, CompressedGeometryHeader, MeshFlag, StripFlag, Version,
    VertexFormat,
};

/// Builds a stream from a mesh: indexed triangles when it has faces,
/// otherwise a point buffer.
pub fn mesh_to_stream(mesh: &Mesh, options: CompressionOptions) -> Result<CompressionStream, CgError> {
    let mut format = VertexFormat::POSITION;
    if mesh.normals.is_some() {
        format = format.with_normals();
    }
    if mesh.colors.is_some() {
        format = format.with_colors(mesh.alpha);
    }
    let vertices: Vec<Vertex> = (0..mesh.vertex_count())
        .map(|i| Vertex {
            position: mesh.positions[i],
            normal: mesh.normals.as_ref().map(|n| n.get(i).copied().unwrap_or([0.0; 3])),
            color: mesh.colors.as_ref().map(|c| c.get(i).copied().unwrap_or([1.0; 4])),
        })
        .collect();

    let buffer_type = if mesh.faces.is_empty() {
        BufferType::Point
    } else {
        BufferType::Triangle
    };
    let mut stream = CompressionStream::with_options(buffer_type, format, options);
    if mesh.faces.is_empty() {
        stream.add_points(&vertices)?;
    } else {
        let indices: Vec<u32> = mesh.faces.iter().flatten().copied().collect();
        stream.add_indexed_triangles(&vertices, &indices)?;
    }
    Ok(stream)
}

pub fn compress_mesh(mesh: &Mesh, options: CompressionOptions) -> Result<CompressedGeometry, CgError> {
    let mut stream = mesh_to_stream(mesh, options)?;
    GeometryCompressor::new().compress(&mut stream)
}

/// Expands a compressed object into a mesh with one vertex per decoded
/// vertex. Positions stay in normalized space.
pub fn decompress_mesh(geometry: &CompressedGeometry) -> Result<Mesh, CgError> {
    let decoded = GeometryDecompressor::decompress(geometry)?;
    let header = &geometry.header;
    let faces = match decoded.buffer_type {
        BufferType::Triangle => decoded
            .triangles()
            .into_iter()
            .map(|t| t.map(|i| i as u32))
            .collect(),
        BufferType::Point | BufferType::Line => Vec::new(),
    };
    Ok(Mesh {
        positions: decoded.vertices.iter().map(|v| v.position).collect(),
        normals: header
            .normals
            .then(|| decoded.vertices.iter().map(|v| v.normal.unwrap_or([0.0; 3])).collect()),
        colors: header
            .colors
            .then(|| decoded.vertices.iter().map(|v| v.color.unwrap_or([1.0; 4])).collect()),
        alpha: header.colors && header.alpha,
        faces,
    })
}

/// Compresses a binary PLY mesh into one geometry object.
pub fn compress(raw_data: &[u8], options: CompressionOptions) -> Result<CompressedGeometry, CgError> {
    let mesh = ply::parse_mesh(raw_data)?;
    compress_mesh(&mesh, options)
}

/// Expands a geometry object into a binary PLY mesh.
pub fn decompress(geometry: &CompressedGeometry, output: &mut Vec<u8>) -> Result<(), CgError> {
    let mesh = decompress_mesh(geometry)?;
    ply::write_mesh(&mesh, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tetrahedron() -> Mesh {
        let positions = vec![
            [1.0, 1.0, 1.0],
            [-1.0, -1.0, 1.0],
            [-1.0, 1.0, -1.0],
            [1.0, -1.0, -1.0],
        ];
        let normals = positions
            .iter()
            .map(|p: &[f32; 3]| p.map(|c| c / 3.0_f32.sqrt()))
            .collect();
        Mesh {
            positions,
            normals: Some(normals),
            colors: Some(vec![
                [1.0, 0.0, 0.0, 1.0],
                [0.0, 1.0, 0.0, 1.0],
                [0.0, 0.0, 1.0, 1.0],
                [1.0, 1.0, 0.0, 1.0],
            ]),
            alpha: false,
            faces: vec![[0, 1, 2], [0, 3, 1], [0, 2, 3], [1, 3, 2]],
        }
    }

    #[test]
    fn test_compress_decompress_mesh() {
        let mesh = tetrahedron();
        let geometry = compress_mesh(&mesh, CompressionOptions::default()).unwrap();
        assert_eq!(geometry.header.buffer_type, BufferType::Triangle);
        assert!(geometry.header.normals && geometry.header.colors && !geometry.header.alpha);

        let back = decompress_mesh(&geometry).unwrap();
        assert_eq!(back.faces.len(), 4);
        let normals = back.normals.as_ref().unwrap();
        let colors = back.colors.as_ref().unwrap();
        for (face, original) in back.faces.iter().zip(&mesh.faces) {
            for (&i, &j) in face.iter().zip(original) {
                let (i, j) = (i as usize, j as usize);
                for k in 0..3 {
                    // Bounds are [-1, 1], so normalized space equals model space.
                    assert!((back.positions[i][k] - mesh.positions[j][k]).abs() < 1e-3);
                    assert!((normals[i][k] - mesh.normals.as_ref().unwrap()[j][k]).abs() < 0.05);
                    assert!((colors[i][k] - mesh.colors.as_ref().unwrap()[j][k]).abs() < 0.01);
                }
            }
        }
    }

    #[test]
    fn test_point_cloud_without_faces() {
        let mesh = Mesh {
            positions: vec![[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 4.0, 0.0]],
            ..Mesh::default()
        };
        let geometry = compress_mesh(&mesh, CompressionOptions::default()).unwrap();
        assert_eq!(geometry.header.buffer_type, BufferType::Point);
        let back = decompress_mesh(&geometry).unwrap();
        assert_eq!(back.positions.len(), 3);
        assert!(back.faces.is_empty() && back.normals.is_none() && back.colors.is_none());
        // Center (1, 2, 0), scale 0.5.
        assert!((back.positions[2][1] - 1.0).abs() < 1e-3);
        assert!((back.positions[0][0] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_ply_round_trip() {
        let mut raw = Vec::new();
        ply::write_mesh(&tetrahedron(), &mut raw).unwrap();
        let geometry = compress(&raw, CompressionOptions::default()).unwrap();
        let mut out = Vec::new();
        decompress(&geometry, &mut out).unwrap();
        let mesh = ply::parse_mesh(&out).unwrap();
        assert_eq!(mesh.faces.len(), 4);
        assert!(mesh.normals.is_some() && mesh.colors.is_some());
    }
}
