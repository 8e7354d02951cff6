use std::{fmt, io};

#[derive(Debug)]
pub enum CgError {
    Io(io::Error),
    BadMagic(u32),
    TruncatedHeader(String),
    TruncatedDirectory(String),
    IndexOutOfRange { index: usize, count: usize },
    ReadOnly,
    Closed,
    AttributeMismatch(String),
    EmptyStream,
    MeshBufferMiss(usize),
    UnregisteredEntry { length: u32, shift: u32, absolute: bool },
    Decode(String),
    ParsePly(String),
}

impl fmt::Display for CgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgError::Io(e) => {
                write!(f, "An I/O error occurred: {}", e)
            }
            CgError::BadMagic(magic) => {
                write!(
                    f,
                    "Not a compressed geometry file (magic number {:#010x})",
                    magic
                )
            }
            CgError::TruncatedHeader(e) => {
                write!(f, "Failed to read the compressed geometry file header: {}", e)
            }
            CgError::TruncatedDirectory(e) => {
                write!(f, "Failed to read the object directory: {}", e)
            }
            CgError::IndexOutOfRange { index, count } => {
                write!(
                    f,
                    "Object index {} is out of range (file holds {} objects)",
                    index, count
                )
            }
            CgError::ReadOnly => {
                write!(f, "The compressed geometry file was opened read-only.")
            }
            CgError::Closed => {
                write!(f, "The compressed geometry file has already been closed.")
            }
            CgError::AttributeMismatch(e) => {
                write!(f, "Vertex attributes do not match the stream format: {}", e)
            }
            CgError::EmptyStream => {
                write!(f, "The compression stream holds no vertices.")
            }
            CgError::MeshBufferMiss(index) => {
                write!(f, "Mesh buffer reference {} names an empty slot", index)
            }
            CgError::UnregisteredEntry { length, shift, absolute } => {
                write!(
                    f,
                    "No Huffman tag for length {}, shift {}, absolute {}",
                    length, shift, absolute
                )
            }
            CgError::Decode(e) => {
                write!(f, "Failed to decode the geometry bitstream: {}", e)
            }
            CgError::ParsePly(e) => {
                write!(f, "Failed to parse the mesh from the buffer: {}", e)
            }
        }
    }
}

impl std::error::Error for CgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CgError {
    fn from(e: io::Error) -> Self {
        CgError::Io(e)
    }
}
