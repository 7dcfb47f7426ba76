//! Scoped scratch storage for column serializers.
//!
//! Every heap-large buffer produced while building a segment is owned by a
//! write-out medium created at the start of the merge. Buffers are plain RAII
//! values: dropping the medium (or an individual buffer) on any exit path
//! releases memory and unlinks temp files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::TempDir;

use crate::error::MergeError;

/// Append-only scratch buffer. Contents are read back once at column
/// finalization time.
pub trait WriteOutBytes {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), MergeError>;
    fn size(&self) -> u64;
    /// Reads the full accumulated contents. The buffer stays appendable.
    fn read_fully(&mut self) -> Result<Vec<u8>, MergeError>;
}

/// Factory for scratch buffers. One medium is created per merge and dropped
/// when the merge ends, successfully or not.
pub trait WriteOutMedium {
    fn make_bytes(&self) -> Result<Box<dyn WriteOutBytes>, MergeError>;
}

/// Selects where scratch buffers live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutType {
    /// Heap-backed; fastest, bounded by available memory.
    OnHeap,
    /// Temp-file-backed in a scratch directory under the output directory.
    TmpFile,
}

pub(crate) fn make_medium(
    kind: WriteOutType,
    out_dir: &Path,
) -> Result<Box<dyn WriteOutMedium>, MergeError> {
    match kind {
        WriteOutType::OnHeap => Ok(Box::new(OnHeapMedium)),
        WriteOutType::TmpFile => Ok(Box::new(TmpFileMedium::new(out_dir)?)),
    }
}

pub struct OnHeapMedium;

impl WriteOutMedium for OnHeapMedium {
    fn make_bytes(&self) -> Result<Box<dyn WriteOutBytes>, MergeError> {
        Ok(Box::new(HeapWriteOutBytes { buf: Vec::new() }))
    }
}

struct HeapWriteOutBytes {
    buf: Vec<u8>,
}

impl WriteOutBytes for HeapWriteOutBytes {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), MergeError> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    fn read_fully(&mut self) -> Result<Vec<u8>, MergeError> {
        Ok(self.buf.clone())
    }
}

/// Medium backed by anonymous temp files in its own scratch directory. The
/// directory is removed when the medium drops; individual files are unlinked
/// when their buffer drops.
pub struct TmpFileMedium {
    dir: TempDir,
}

impl TmpFileMedium {
    pub fn new(base: &Path) -> Result<Self, MergeError> {
        std::fs::create_dir_all(base)?;
        Ok(Self {
            dir: TempDir::with_prefix_in("writeout-", base)?,
        })
    }
}

impl WriteOutMedium for TmpFileMedium {
    fn make_bytes(&self) -> Result<Box<dyn WriteOutBytes>, MergeError> {
        let file = tempfile::tempfile_in(self.dir.path())?;
        Ok(Box::new(FileWriteOutBytes { file, size: 0 }))
    }
}

struct FileWriteOutBytes {
    file: File,
    size: u64,
}

impl WriteOutBytes for FileWriteOutBytes {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), MergeError> {
        self.file.write_all(buf)?;
        self.size += buf.len() as u64;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_fully(&mut self) -> Result<Vec<u8>, MergeError> {
        self.file.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut out)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(out)
    }
}
