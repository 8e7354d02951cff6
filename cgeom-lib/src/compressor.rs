use crate::command::{CommandStream, SET_STATE};
use crate::common::from_fixed;
use crate::element::QuantizerState;
use crate::error::CgError;
use crate::file::CompressedGeometryFile;
use crate::huffman::{HuffmanTable, TableKind};
use crate::stream::CompressionStream;
use crate::structures::{CompressedGeometry, CompressedGeometryHeader, Version};
use tracing::{debug, trace};

/// Turns a [`CompressionStream`] into a Huffman-coded geometry object.
#[derive(Debug, Default)]
pub struct GeometryCompressor {
    table: HuffmanTable,
}

impl GeometryCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag table built by the most recent [`compress`](Self::compress) call.
    pub fn table(&self) -> &HuffmanTable {
        &self.table
    }

    pub fn compress(&mut self, stream: &mut CompressionStream) -> Result<CompressedGeometry, CgError> {
        if stream.vertex_count() == 0 {
            return Err(CgError::EmptyStream);
        }
        let normalization = stream.normalization();
        let options = *stream.options();
        let format = stream.format();

        // Quantize every element and tally its profile.
        let mut state = QuantizerState::new(
            &normalization,
            options.position_bits,
            options.color_bits,
            options.normal_bits,
        );
        self.table = HuffmanTable::new();
        for element in &mut stream.elements {
            element.quantize(&mut state, &mut self.table)?;
        }
        self.table.compute_tags();
        for kind in TableKind::ALL {
            trace!(table = ?kind, tags = self.table.nodes(kind).len(), "Huffman table ready");
        }

        // Emit the state, the tables and the elements.
        let mut output = CommandStream::new();
        let state_command = SET_STATE
            | (u32::from(format.normals) << 2)
            | (u32::from(format.colors) << 1)
            | u32::from(format.alpha);
        output.add_command(state_command, 8, 0, 0);
        self.table.output_commands(&mut output);
        for element in &stream.elements {
            element.output(&self.table, &mut output)?;
        }
        let bits = output.bit_length();
        let data = output.finish();

        let (lower_bound, upper_bound) = match state.bounds() {
            Some((lower, upper)) => (
                Some(normalization.to_model_space(lower.map(from_fixed))),
                Some(normalization.to_model_space(upper.map(from_fixed))),
            ),
            None => (None, None),
        };

        debug!(
            elements = stream.elements.len(),
            vertices = stream.vertex_count(),
            position_bits = state.position_quant(),
            bits,
            bytes = data.len(),
            "compressed geometry stream"
        );

        Ok(CompressedGeometry {
            header: CompressedGeometryHeader {
                version: Version::CURRENT,
                buffer_type: stream.buffer_type(),
                normals: format.normals,
                colors: format.colors,
                alpha: format.alpha,
                size: data.len(),
                lower_bound,
                upper_bound,
            },
            data,
        })
    }

    /// Compresses `stream` and appends the object to `file`.
    pub fn compress_to_file(
        &mut self,
        stream: &mut CompressionStream,
        file: &mut CompressedGeometryFile,
    ) -> Result<(), CgError> {
        let geometry = self.compress(stream)?;
        file.write(&geometry)
    }
}
