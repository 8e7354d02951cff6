use crate::error::CgError;
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const MAGIC: u32 = 0xBADD_FAB4;
pub const HEADER_SIZE: u64 = 32;
pub const BLOCK_HEADER_SIZE: usize = 8;

pub const MAJOR_VERSION: u32 = 1;
pub const MINOR_VERSION: u32 = 0;
pub const MINOR_MINOR_VERSION: u32 = 1;

pub const TYPE_MASK: u32 = 0x03;
pub const TYPE_POINT: u32 = 1;
pub const TYPE_LINE: u32 = 2;
pub const TYPE_TRIANGLE: u32 = 3;
pub const NORMAL_PRESENT_MASK: u32 = 0x04;
pub const COLOR_PRESENT_MASK: u32 = 0x08;
pub const ALPHA_PRESENT_MASK: u32 = 0x10;

/// Entries held by the mesh buffer.
pub const MESH_BUFFER_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub(crate) struct FileHeader {
    pub magic: U32,
    pub major: U32,
    pub minor: U32,
    pub minor_minor: U32,
    pub object_count: U32,
    pub padding: U32,
    pub directory_offset: U64,
}

const _: () = assert!(size_of::<FileHeader>() == HEADER_SIZE as usize);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub(crate) struct BlockHeader {
    pub size: U32,
    pub descriptor: U32,
}

const _: () = assert!(size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub minor_minor: u32,
}

impl Version {
    pub const CURRENT: Version = Version {
        major: MAJOR_VERSION,
        minor: MINOR_VERSION,
        minor_minor: MINOR_MINOR_VERSION,
    };
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.minor_minor)
    }
}

/// Primitive topology of a compressed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Point,
    Line,
    Triangle,
}

impl BufferType {
    pub const fn code(self) -> u32 {
        match self {
            BufferType::Point => TYPE_POINT,
            BufferType::Line => TYPE_LINE,
            BufferType::Triangle => TYPE_TRIANGLE,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, CgError> {
        match code & TYPE_MASK {
            TYPE_POINT => Ok(BufferType::Point),
            TYPE_LINE => Ok(BufferType::Line),
            TYPE_TRIANGLE => Ok(BufferType::Triangle),
            other => Err(CgError::Decode(format!("Unknown buffer type {}", other))),
        }
    }
}

/// How a vertex joins the generalized strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StripFlag {
    Restart,
    ReplaceOldest,
    ReplaceMiddle,
}

impl StripFlag {
    pub(crate) const fn code(self) -> u32 {
        match self {
            StripFlag::Restart => 1,
            StripFlag::ReplaceOldest => 2,
            StripFlag::ReplaceMiddle => 3,
        }
    }

    pub(crate) fn from_code(code: u32) -> Result<Self, CgError> {
        match code {
            1 => Ok(StripFlag::Restart),
            2 => Ok(StripFlag::ReplaceOldest),
            3 => Ok(StripFlag::ReplaceMiddle),
            other => Err(CgError::Decode(format!("Invalid replace code {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshFlag {
    NoPush,
    Push,
}

/// Per-vertex attributes bundled with every vertex of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VertexFormat {
    pub normals: bool,
    pub colors: bool,
    pub alpha: bool,
}

impl VertexFormat {
    pub const POSITION: VertexFormat = VertexFormat {
        normals: false,
        colors: false,
        alpha: false,
    };

    pub fn with_normals(mut self) -> Self {
        self.normals = true;
        self
    }

    pub fn with_colors(mut self, alpha: bool) -> Self {
        self.colors = true;
        self.alpha = alpha;
        self
    }

    pub(crate) fn color_components(&self) -> usize {
        if self.alpha {
            4
        } else {
            3
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressedGeometryHeader {
    pub version: Version,
    pub buffer_type: BufferType,
    pub normals: bool,
    pub colors: bool,
    pub alpha: bool,
    /// Payload size in bytes.
    pub size: usize,
    /// Model-space bounds; not persisted by the container file.
    pub lower_bound: Option<[f32; 3]>,
    pub upper_bound: Option<[f32; 3]>,
}

impl CompressedGeometryHeader {
    pub fn descriptor(&self) -> u32 {
        let mut descriptor = self.buffer_type.code();
        if self.normals {
            descriptor |= NORMAL_PRESENT_MASK;
        }
        if self.colors {
            descriptor |= COLOR_PRESENT_MASK;
        }
        if self.alpha {
            descriptor |= ALPHA_PRESENT_MASK;
        }
        descriptor
    }

    pub fn from_descriptor(descriptor: u32, size: usize, version: Version) -> Result<Self, CgError> {
        Ok(CompressedGeometryHeader {
            version,
            buffer_type: BufferType::from_code(descriptor)?,
            normals: descriptor & NORMAL_PRESENT_MASK != 0,
            colors: descriptor & COLOR_PRESENT_MASK != 0,
            alpha: descriptor & ALPHA_PRESENT_MASK != 0,
            size,
            lower_bound: None,
            upper_bound: None,
        })
    }
}

/// One compressed geometry object: header plus Huffman-coded command stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedGeometry {
    pub header: CompressedGeometryHeader,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_bits() {
        let header = CompressedGeometryHeader {
            version: Version::CURRENT,
            buffer_type: BufferType::Triangle,
            normals: true,
            colors: true,
            alpha: false,
            size: 10,
            lower_bound: None,
            upper_bound: None,
        };
        assert_eq!(header.descriptor(), 0b0_1111);
        let back = CompressedGeometryHeader::from_descriptor(0b1_1110, 4, Version::CURRENT).unwrap();
        assert_eq!(back.buffer_type, BufferType::Line);
        assert!(back.normals && back.colors && back.alpha);
        assert!(CompressedGeometryHeader::from_descriptor(0, 4, Version::CURRENT).is_err());
    }

    #[test]
    fn test_version_ordering() {
        let a = Version { major: 1, minor: 2, minor_minor: 0 };
        let b = Version { major: 1, minor: 1, minor_minor: 9 };
        let c = Version { major: 2, minor: 0, minor_minor: 0 };
        assert!(a > b);
        assert!(c > a);
        assert_eq!(a.max(b).max(c), c);
    }
}
