//! Container file holding any number of compressed geometry objects.
//!
//! Layout: a 32-byte header, the objects back to back (each an 8-byte block
//! header followed by its payload), zero padding up to the next multiple of 8,
//! then a directory of one big-endian 64-bit file offset per object. The
//! header records where the directory starts. Appending writes over the
//! padding and the old directory; the directory and header are rewritten on
//! close.

use crate::error::CgError;
use crate::structures::{
    BlockHeader, CompressedGeometry, CompressedGeometryHeader, FileHeader, Version,
    BLOCK_HEADER_SIZE, HEADER_SIZE, MAGIC,
};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, IntoBytes};

const DIRECTORY_ALIGNMENT: u64 = 8;

/// Whole objects read ahead of the sequential read position.
#[derive(Debug, Default)]
struct ReadAhead {
    first: usize,
    count: usize,
    offset: u64,
    bytes: Vec<u8>,
}

impl ReadAhead {
    fn contains(&self, index: usize) -> bool {
        index >= self.first && index < self.first + self.count
    }

    fn invalidate(&mut self) {
        self.count = 0;
    }
}

#[derive(Debug)]
pub struct CompressedGeometryFile {
    path: PathBuf,
    file: Option<File>,
    read_write: bool,
    version: Version,
    directory: Vec<u64>,
    data_end: u64,
    current: usize,
    dirty: bool,
    cache: ReadAhead,
}

fn read_exact_or<E>(file: &mut File, buffer: &mut [u8], error: E) -> Result<(), CgError>
where
    E: FnOnce(io::Error) -> CgError,
{
    file.read_exact(buffer).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            error(e)
        } else {
            CgError::Io(e)
        }
    })
}

impl CompressedGeometryFile {
    /// Opens a container. With `read_write`, a missing or empty file is
    /// created as an empty container.
    pub fn open<P: AsRef<Path>>(path: P, read_write: bool) -> Result<Self, CgError> {
        let path = path.as_ref().to_path_buf();
        let mut file = if read_write {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?
        } else {
            File::open(&path)?
        };

        let mut container = CompressedGeometryFile {
            path,
            file: None,
            read_write,
            version: Version::CURRENT,
            directory: Vec::new(),
            data_end: HEADER_SIZE,
            current: 0,
            dirty: false,
            cache: ReadAhead::default(),
        };

        if read_write && file.metadata()?.len() == 0 {
            debug!(path = %container.path.display(), "initializing empty container");
            container.dirty = true;
        } else {
            // Any failure here drops `file`, closing the handle.
            container.read_index(&mut file)?;
        }
        container.file = Some(file);
        Ok(container)
    }

    fn read_index(&mut self, file: &mut File) -> Result<(), CgError> {
        let mut bytes = [0_u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        read_exact_or(file, &mut bytes, |e| CgError::TruncatedHeader(e.to_string()))?;
        let header = FileHeader::read_from_bytes(&bytes)
            .map_err(|_| CgError::TruncatedHeader("header is not 32 bytes".to_string()))?;
        if header.magic.get() != MAGIC {
            return Err(CgError::BadMagic(header.magic.get()));
        }
        self.version = Version {
            major: header.major.get(),
            minor: header.minor.get(),
            minor_minor: header.minor_minor.get(),
        };

        let count = header.object_count.get() as usize;
        let directory_offset = header.directory_offset.get();
        if directory_offset.saturating_add(count as u64 * 8) > file.metadata()?.len() {
            return Err(CgError::TruncatedDirectory(format!(
                "{} entries at offset {} run past the end of the file",
                count, directory_offset
            )));
        }
        let mut bytes = vec![0_u8; count * 8];
        file.seek(SeekFrom::Start(directory_offset))?;
        read_exact_or(file, &mut bytes, |e| CgError::TruncatedDirectory(e.to_string()))?;
        self.directory = bytes
            .chunks_exact(8)
            .filter_map(|chunk| U64::read_from_bytes(chunk).ok())
            .map(|offset| offset.get())
            .collect();
        if self
            .directory
            .iter()
            .any(|&offset| offset < HEADER_SIZE || offset >= directory_offset)
        {
            return Err(CgError::TruncatedDirectory(
                "directory entry points outside the object area".to_string(),
            ));
        }
        if self.directory.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(CgError::TruncatedDirectory(
                "directory offsets are not in file order".to_string(),
            ));
        }
        self.data_end = match self.directory.last() {
            Some(&last) => Self::object_end(file, last, directory_offset)?,
            None => directory_offset,
        };

        debug!(
            path = %self.path.display(),
            version = %self.version,
            objects = count,
            "opened compressed geometry file"
        );
        Ok(())
    }

    /// End of the object at `offset`, from its block header. Everything from
    /// there to the directory is padding.
    fn object_end(file: &mut File, offset: u64, directory_offset: u64) -> Result<u64, CgError> {
        let mut bytes = [0_u8; BLOCK_HEADER_SIZE];
        file.seek(SeekFrom::Start(offset))?;
        read_exact_or(file, &mut bytes, |e| CgError::TruncatedDirectory(e.to_string()))?;
        let block = BlockHeader::read_from_bytes(&bytes[..])
            .map_err(|_| CgError::TruncatedDirectory("short block header".to_string()))?;
        let end = offset + BLOCK_HEADER_SIZE as u64 + u64::from(block.size.get());
        if end > directory_offset {
            return Err(CgError::TruncatedDirectory(format!(
                "object at offset {} runs {} bytes into the directory",
                offset,
                end - directory_offset
            )));
        }
        Ok(end)
    }

    fn handle(&mut self) -> Result<&mut File, CgError> {
        self.file.as_mut().ok_or(CgError::Closed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest version of any object in the file.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn object_count(&self) -> usize {
        self.directory.len()
    }

    /// Index of the object the next [`read_next`](Self::read_next) returns.
    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn set_current_index(&mut self, index: usize) -> Result<(), CgError> {
        if index > self.object_count() {
            return Err(CgError::IndexOutOfRange {
                index,
                count: self.object_count(),
            });
        }
        self.current = index;
        Ok(())
    }

    /// Bytes occupied by object `index`, block header included.
    pub fn object_size(&self, index: usize) -> Result<u64, CgError> {
        let start = *self.directory.get(index).ok_or(CgError::IndexOutOfRange {
            index,
            count: self.object_count(),
        })?;
        let end = self.directory.get(index + 1).copied().unwrap_or(self.data_end);
        Ok(end - start)
    }

    fn largest_object(&self) -> u64 {
        (0..self.object_count())
            .filter_map(|i| self.object_size(i).ok())
            .max()
            .unwrap_or(0)
    }

    fn parse_object(&self, index: usize, bytes: &[u8]) -> Result<CompressedGeometry, CgError> {
        let (block, _) = BlockHeader::read_from_prefix(bytes)
            .map_err(|_| CgError::Decode(format!("object {} is shorter than its block header", index)))?;
        let size = block.size.get() as usize;
        let data = bytes
            .get(BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + size)
            .ok_or_else(|| {
                CgError::Decode(format!(
                    "object {} declares {} bytes but only {} are stored",
                    index,
                    size,
                    bytes.len().saturating_sub(BLOCK_HEADER_SIZE)
                ))
            })?;
        Ok(CompressedGeometry {
            header: CompressedGeometryHeader::from_descriptor(block.descriptor.get(), size, self.version)?,
            data: data.to_vec(),
        })
    }

    fn read_span(&mut self, offset: u64, length: u64) -> Result<Vec<u8>, CgError> {
        let file = self.handle()?;
        let mut bytes = vec![0_u8; length as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn cached_object(&self, index: usize) -> Result<CompressedGeometry, CgError> {
        let start = (self.directory[index] - self.cache.offset) as usize;
        let end = start + self.object_size(index)? as usize;
        self.parse_object(index, &self.cache.bytes[start..end])
    }

    /// Fills the read-ahead buffer with as many whole objects from `first`
    /// as fit in the size of the largest object.
    fn refill(&mut self, first: usize) -> Result<(), CgError> {
        let capacity = self.largest_object();
        let offset = self.directory[first];
        let mut length = 0;
        let mut count = 0;
        while first + count < self.object_count() {
            let size = self.object_size(first + count)?;
            if count > 0 && length + size > capacity {
                break;
            }
            length += size;
            count += 1;
        }
        let bytes = self.read_span(offset, length)?;
        trace!(first, count, bytes = length, "refilled read-ahead buffer");
        self.cache = ReadAhead {
            first,
            count,
            offset,
            bytes,
        };
        Ok(())
    }

    /// Reads the object at the current index and advances, or returns
    /// `None` past the last object.
    pub fn read_next(&mut self) -> Result<Option<CompressedGeometry>, CgError> {
        if self.current >= self.object_count() {
            return Ok(None);
        }
        let index = self.current;
        if !self.cache.contains(index) {
            self.refill(index)?;
        }
        let geometry = self.cached_object(index)?;
        self.current += 1;
        Ok(Some(geometry))
    }

    /// Reads object `index` and leaves the current index just after it.
    pub fn read(&mut self, index: usize) -> Result<CompressedGeometry, CgError> {
        if index >= self.object_count() {
            return Err(CgError::IndexOutOfRange {
                index,
                count: self.object_count(),
            });
        }
        let geometry = if self.cache.contains(index) {
            self.cached_object(index)?
        } else {
            self.cache.invalidate();
            let offset = self.directory[index];
            let size = self.object_size(index)?;
            let bytes = self.read_span(offset, size)?;
            self.parse_object(index, &bytes)?
        };
        self.current = index + 1;
        Ok(geometry)
    }

    /// Reads every object from the start of the file.
    pub fn read_all(&mut self) -> Result<Vec<CompressedGeometry>, CgError> {
        self.current = 0;
        let mut objects = Vec::with_capacity(self.object_count());
        while let Some(geometry) = self.read_next()? {
            objects.push(geometry);
        }
        Ok(objects)
    }

    /// Appends an object after the last one.
    pub fn write(&mut self, geometry: &CompressedGeometry) -> Result<(), CgError> {
        if !self.read_write {
            return Err(CgError::ReadOnly);
        }
        let offset = self.data_end;
        let block = BlockHeader {
            size: U32::new(geometry.data.len() as u32),
            descriptor: U32::new(geometry.header.descriptor()),
        };
        let file = self.handle()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(block.as_bytes())?;
        file.write_all(&geometry.data)?;

        self.directory.push(offset);
        self.data_end = offset + (BLOCK_HEADER_SIZE + geometry.data.len()) as u64;
        self.version = self.version.max(geometry.header.version);
        self.dirty = true;
        self.cache.invalidate();
        trace!(index = self.directory.len() - 1, offset, bytes = geometry.data.len(), "appended object");
        Ok(())
    }

    /// Drops every object, leaving an empty container.
    pub fn clear(&mut self) -> Result<(), CgError> {
        if !self.read_write {
            return Err(CgError::ReadOnly);
        }
        self.handle()?.set_len(HEADER_SIZE)?;
        self.directory.clear();
        self.data_end = HEADER_SIZE;
        self.current = 0;
        self.version = Version::CURRENT;
        self.dirty = true;
        self.cache.invalidate();
        Ok(())
    }

    fn write_index(&mut self) -> Result<(), CgError> {
        let directory_offset = self.data_end.next_multiple_of(DIRECTORY_ALIGNMENT);
        let header = FileHeader {
            magic: U32::new(MAGIC),
            major: U32::new(self.version.major),
            minor: U32::new(self.version.minor),
            minor_minor: U32::new(self.version.minor_minor),
            object_count: U32::new(self.directory.len() as u32),
            padding: U32::new(0),
            directory_offset: U64::new(directory_offset),
        };
        let mut tail = vec![0_u8; (directory_offset - self.data_end) as usize];
        for &offset in &self.directory {
            tail.extend_from_slice(U64::new(offset).as_bytes());
        }
        let end = self.data_end + tail.len() as u64;

        let data_end = self.data_end;
        let file = self.handle()?;
        file.seek(SeekFrom::Start(data_end))?;
        file.write_all(&tail)?;
        file.set_len(end)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Writes the directory and header if anything changed, then releases
    /// the handle. Closing again does nothing.
    pub fn close(&mut self) -> Result<(), CgError> {
        if self.file.is_none() {
            return Ok(());
        }
        let result = if self.dirty { self.write_index() } else { Ok(()) };
        self.dirty = false;
        self.file = None;
        self.cache = ReadAhead::default();
        if result.is_ok() {
            debug!(path = %self.path.display(), objects = self.directory.len(), "closed compressed geometry file");
        }
        result
    }
}

impl Drop for CompressedGeometryFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to close compressed geometry file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::BufferType;
    use tempfile::tempdir;

    fn object(buffer_type: BufferType, data: Vec<u8>) -> CompressedGeometry {
        CompressedGeometry {
            header: CompressedGeometryHeader {
                version: Version::CURRENT,
                buffer_type,
                normals: true,
                colors: false,
                alpha: false,
                size: data.len(),
                lower_bound: None,
                upper_bound: None,
            },
            data,
        }
    }

    #[test]
    fn test_new_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("objects.cg");

        let mut file = CompressedGeometryFile::open(&path, true).unwrap();
        assert_eq!(file.object_count(), 0);
        file.write(&object(BufferType::Triangle, vec![1, 2, 3])).unwrap();
        file.write(&object(BufferType::Point, vec![4; 10])).unwrap();
        file.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], &MAGIC.to_be_bytes());
        // header + (8 + 3) + (8 + 10) ends at 61; the directory starts at 64.
        assert_eq!(bytes.len(), 64 + 16);
        assert_eq!(&bytes[24..32], &64_u64.to_be_bytes());
        assert_eq!(&bytes[61..64], &[0, 0, 0]);
        assert_eq!(&bytes[64..72], &32_u64.to_be_bytes());
        assert_eq!(&bytes[72..80], &43_u64.to_be_bytes());

        let mut file = CompressedGeometryFile::open(&path, false).unwrap();
        assert_eq!(file.object_count(), 2);
        assert_eq!(file.object_size(0).unwrap(), 11);
        assert_eq!(file.object_size(1).unwrap(), 18);
        let second = file.read(1).unwrap();
        assert_eq!(second.data, vec![4; 10]);
        assert_eq!(second.header.buffer_type, BufferType::Point);
        assert!(second.header.normals);
        assert_eq!(file.current_index(), 2);
        assert!(file.read_next().unwrap().is_none());
    }

    /// Writes two objects and returns the closed file's bytes.
    fn two_objects(path: &Path) -> Vec<u8> {
        let mut file = CompressedGeometryFile::open(path, true).unwrap();
        file.write(&object(BufferType::Triangle, vec![1, 2, 3])).unwrap();
        file.write(&object(BufferType::Point, vec![4; 10])).unwrap();
        file.close().unwrap();
        std::fs::read(path).unwrap()
    }

    fn reopen_with(path: &Path, bytes: &[u8]) -> Result<CompressedGeometryFile, CgError> {
        std::fs::write(path, bytes).unwrap();
        CompressedGeometryFile::open(path, false)
    }

    #[test]
    fn test_append_overwrites_directory_padding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("append.cg");
        two_objects(&path);

        let mut file = CompressedGeometryFile::open(&path, true).unwrap();
        assert_eq!(file.object_size(1).unwrap(), 18);
        file.write(&object(BufferType::Line, vec![5; 4])).unwrap();
        file.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // Objects stay back to back: 61 + (8 + 4) = 73, directory at 80.
        assert_eq!(&bytes[24..32], &80_u64.to_be_bytes());
        assert_eq!(&bytes[80 + 16..80 + 24], &61_u64.to_be_bytes());
        let mut file = CompressedGeometryFile::open(&path, false).unwrap();
        assert_eq!(file.object_size(2).unwrap(), 12);
        let objects = file.read_all().unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[1].data, vec![4; 10]);
        assert_eq!(objects[2].data, vec![5; 4]);
    }

    #[test]
    fn test_truncated_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cut.cg");
        let bytes = two_objects(&path);
        match reopen_with(&path, &bytes[..bytes.len() - 3]) {
            Err(CgError::TruncatedDirectory(message)) => {
                assert_eq!(message, "2 entries at offset 64 run past the end of the file");
            }
            other => panic!("unexpected {:?}", other.map(|f| f.object_count())),
        }
    }

    #[test]
    fn test_directory_entries_outside_object_area_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outside.cg");
        let bytes = two_objects(&path);

        for (slot, offset) in [(64, 8_u64), (72, 64), (72, 1000)] {
            let mut patched = bytes.clone();
            patched[slot..slot + 8].copy_from_slice(&offset.to_be_bytes());
            assert!(
                matches!(reopen_with(&path, &patched), Err(CgError::TruncatedDirectory(_))),
                "entry {} set to {}",
                (slot - 64) / 8,
                offset
            );
        }
    }

    #[test]
    fn test_decreasing_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("order.cg");
        let mut bytes = two_objects(&path);
        let (first, second) = bytes[64..80].split_at_mut(8);
        first.swap_with_slice(second);
        assert!(matches!(
            reopen_with(&path, &bytes),
            Err(CgError::TruncatedDirectory(_))
        ));
    }

    #[test]
    fn test_last_object_running_into_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overrun.cg");
        let mut bytes = two_objects(&path);
        // Block header of the second object, size field first.
        bytes[43..47].copy_from_slice(&14_u32.to_be_bytes());
        assert!(matches!(
            reopen_with(&path, &bytes),
            Err(CgError::TruncatedDirectory(_))
        ));
        // Growing into the padding alone is still inside the object area.
        bytes[43..47].copy_from_slice(&13_u32.to_be_bytes());
        let mut file = reopen_with(&path, &bytes).unwrap();
        assert_eq!(file.object_size(1).unwrap(), 21);
        assert_eq!(file.read(1).unwrap().data, [vec![4; 10], vec![0; 3]].concat());
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.cg");
        std::fs::write(&path, [0_u8; 40]).unwrap();
        assert!(matches!(
            CompressedGeometryFile::open(&path, false),
            Err(CgError::BadMagic(0))
        ));
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.cg");
        std::fs::write(&path, MAGIC.to_be_bytes()).unwrap();
        assert!(matches!(
            CompressedGeometryFile::open(&path, false),
            Err(CgError::TruncatedHeader(_))
        ));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.cg");
        CompressedGeometryFile::open(&path, true).unwrap().close().unwrap();

        let mut file = CompressedGeometryFile::open(&path, false).unwrap();
        assert!(matches!(
            file.write(&object(BufferType::Line, vec![0])),
            Err(CgError::ReadOnly)
        ));
        assert!(matches!(file.clear(), Err(CgError::ReadOnly)));
    }

    #[test]
    fn test_index_out_of_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("range.cg");
        let mut file = CompressedGeometryFile::open(&path, true).unwrap();
        file.write(&object(BufferType::Line, vec![7])).unwrap();
        assert!(matches!(
            file.read(1),
            Err(CgError::IndexOutOfRange { index: 1, count: 1 })
        ));
        assert!(file.set_current_index(1).is_ok());
        assert!(file.set_current_index(2).is_err());
    }

    #[test]
    fn test_sequential_reads_use_read_ahead() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.cg");
        let mut file = CompressedGeometryFile::open(&path, true).unwrap();
        file.write(&object(BufferType::Triangle, vec![9; 40])).unwrap();
        for i in 0..4 {
            file.write(&object(BufferType::Point, vec![i; 8])).unwrap();
        }
        file.close().unwrap();

        let mut file = CompressedGeometryFile::open(&path, false).unwrap();
        assert_eq!(file.read_next().unwrap().unwrap().data, vec![9; 40]);
        // The small objects all fit in one buffer the size of the large one.
        assert_eq!(file.read_next().unwrap().unwrap().data, vec![0; 8]);
        assert_eq!((file.cache.first, file.cache.count), (1, 3));
        assert_eq!(file.read(2).unwrap().data, vec![1; 8]);
        assert_eq!((file.cache.first, file.cache.count), (1, 3));
        let rest: Vec<_> = std::iter::from_fn(|| file.read_next().unwrap()).collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].data, vec![3; 8]);
    }

    #[test]
    fn test_clear_and_reuse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clear.cg");
        let mut file = CompressedGeometryFile::open(&path, true).unwrap();
        file.write(&object(BufferType::Triangle, vec![1; 5])).unwrap();
        file.clear().unwrap();
        file.write(&object(BufferType::Point, vec![2; 3])).unwrap();
        file.close().unwrap();
        file.close().unwrap();

        let mut file = CompressedGeometryFile::open(&path, false).unwrap();
        let all = file.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].data, vec![2; 3]);
    }

    #[test]
    fn test_closed_file_rejects_io() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("closed.cg");
        let mut file = CompressedGeometryFile::open(&path, true).unwrap();
        file.write(&object(BufferType::Point, vec![1])).unwrap();
        file.close().unwrap();
        assert!(matches!(file.read(0), Err(CgError::Closed)));
        assert!(matches!(
            file.write(&object(BufferType::Point, vec![1])),
            Err(CgError::Closed)
        ));
    }
}
