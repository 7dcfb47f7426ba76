//! Bounded multi-file blob container.
//!
//! Many named byte blobs are concatenated into a small number of physical
//! `NNNNN.smoosh` files, each capped in size. A directory manifest
//! (`meta.smoosh`) records `(file index, start, end)` per name and is written
//! at [`Smoosher::close`], the single commit point: nothing is committed if
//! any error happens earlier.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::MergeError;
use crate::util::{crc32, read_string, read_u32, read_u64, write_string, write_u32, write_u64};

const META_MAGIC: &[u8; 8] = b"LITSMSH1";
const META_VERSION: u32 = 1;

/// Default per-file cap. A single blob may exceed it, in which case the blob
/// occupies a file of its own.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 0x7FFF_FFFF;

pub(crate) const META_FILE: &str = "meta.smoosh";

fn chunk_file_name(index: u32) -> String {
    format!("{:05}.smoosh", index)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SmooshEntry {
    name: String,
    file_index: u32,
    start: u64,
    end: u64,
}

/// Writer half of the container.
pub struct Smoosher {
    out_dir: PathBuf,
    max_file_size: u64,
    current: Option<BufWriter<File>>,
    current_index: u32,
    current_offset: u64,
    file_count: u32,
    entries: Vec<SmooshEntry>,
    names: HashSet<String>,
}

impl Smoosher {
    pub fn new(out_dir: &Path) -> Result<Self, MergeError> {
        Self::with_max_file_size(out_dir, DEFAULT_MAX_FILE_SIZE)
    }

    pub fn with_max_file_size(out_dir: &Path, max_file_size: u64) -> Result<Self, MergeError> {
        if max_file_size == 0 {
            return Err(MergeError::InvalidInput(
                "Container file size cap must be positive".to_string(),
            ));
        }
        std::fs::create_dir_all(out_dir)?;
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            max_file_size,
            current: None,
            current_index: 0,
            current_offset: 0,
            file_count: 0,
            entries: Vec::new(),
            names: HashSet::new(),
        })
    }

    /// Adds a complete blob under `name`.
    pub fn add(&mut self, name: &str, bytes: &[u8]) -> Result<(), MergeError> {
        let mut writer = self.writer(name, bytes.len() as u64)?;
        writer.write_all(bytes)?;
        writer.finish()
    }

    /// Reserves exactly `size` bytes under `name` and returns a writer for
    /// them. The caller must write exactly `size` bytes and call
    /// [`SmooshWriter::finish`].
    pub fn writer(&mut self, name: &str, size: u64) -> Result<SmooshWriter<'_>, MergeError> {
        if !self.names.insert(name.to_string()) {
            return Err(MergeError::InvalidInput(format!(
                "Duplicate blob name [{}] in container",
                name
            )));
        }
        self.ensure_room(size)?;
        Ok(SmooshWriter {
            smoosher: self,
            name: name.to_string(),
            expected: size,
            written: 0,
        })
    }

    /// Starts a new physical file if the blob does not fit in the current
    /// one. A blob larger than the cap still goes into a single file.
    fn ensure_room(&mut self, size: u64) -> Result<(), MergeError> {
        let needs_rotate = match &self.current {
            None => true,
            Some(_) => {
                self.current_offset > 0 && self.current_offset.saturating_add(size) > self.max_file_size
            }
        };
        if needs_rotate {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), MergeError> {
        self.finish_current_file()?;
        let index = self.file_count;
        let path = self.out_dir.join(chunk_file_name(index));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        self.current = Some(BufWriter::new(file));
        self.current_index = index;
        self.current_offset = 0;
        self.file_count += 1;
        Ok(())
    }

    fn finish_current_file(&mut self) -> Result<(), MergeError> {
        if let Some(mut w) = self.current.take() {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Writes the directory manifest and commits the container.
    pub fn close(mut self) -> Result<(), MergeError> {
        self.finish_current_file()?;

        let mut table = Vec::new();
        write_u64(&mut table, self.max_file_size);
        write_u32(&mut table, self.file_count);
        write_u32(&mut table, self.entries.len() as u32);
        for entry in &self.entries {
            write_string(&mut table, &entry.name);
            write_u32(&mut table, entry.file_index);
            write_u64(&mut table, entry.start);
            write_u64(&mut table, entry.end);
        }

        let mut w = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.out_dir.join(META_FILE))?,
        );
        w.write_all(META_MAGIC)?;
        w.write_all(&META_VERSION.to_le_bytes())?;
        w.write_all(&(table.len() as u64).to_le_bytes())?;
        w.write_all(&crc32(&table).to_le_bytes())?;
        w.write_all(&table)?;
        w.flush()?;
        w.get_ref().sync_data()?;
        Ok(())
    }
}

/// Exact-size reserved writer into the container.
pub struct SmooshWriter<'a> {
    smoosher: &'a mut Smoosher,
    name: String,
    expected: u64,
    written: u64,
}

impl SmooshWriter<'_> {
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), MergeError> {
        let w = self
            .smoosher
            .current
            .as_mut()
            .ok_or_else(|| MergeError::Internal("Container writer has no open file".to_string()))?;
        w.write_all(bytes)?;
        self.written += bytes.len() as u64;
        if self.written > self.expected {
            return Err(MergeError::Internal(format!(
                "Blob [{}] overflowed its reservation: wrote {} of {} bytes",
                self.name, self.written, self.expected
            )));
        }
        Ok(())
    }

    pub fn finish(self) -> Result<(), MergeError> {
        if self.written != self.expected {
            return Err(MergeError::Internal(format!(
                "Blob [{}] short write: wrote {} of {} reserved bytes",
                self.name, self.written, self.expected
            )));
        }
        let start = self.smoosher.current_offset;
        let end = start + self.written;
        self.smoosher.entries.push(SmooshEntry {
            name: self.name,
            file_index: self.smoosher.current_index,
            start,
            end,
        });
        self.smoosher.current_offset = end;
        Ok(())
    }
}

impl std::io::Write for SmooshWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        SmooshWriter::write_all(self, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Reader half: parses `meta.smoosh` and serves named blobs.
#[derive(Debug)]
pub struct SmooshedDir {
    dir: PathBuf,
    entries: BTreeMap<String, (u32, u64, u64)>,
}

impl SmooshedDir {
    pub fn open(dir: &Path) -> Result<Self, MergeError> {
        let meta_path = dir.join(META_FILE);
        let mut f = File::open(&meta_path)?;
        let mut magic = [0u8; 8];
        f.read_exact(&mut magic)?;
        if &magic != META_MAGIC {
            return Err(MergeError::Corruption {
                details: format!("Bad container directory magic in {:?}", meta_path),
            });
        }
        let version = read_u32(&mut f)?;
        if version != META_VERSION {
            return Err(MergeError::Corruption {
                details: format!(
                    "Unsupported container directory version {} in {:?}",
                    version, meta_path
                ),
            });
        }
        let table_len = read_u64(&mut f)? as usize;
        let expected_crc = read_u32(&mut f)?;
        let mut table = vec![0u8; table_len];
        f.read_exact(&mut table)?;
        if crc32(&table) != expected_crc {
            return Err(MergeError::Corruption {
                details: format!("Container directory CRC mismatch in {:?}", meta_path),
            });
        }

        let mut cur = std::io::Cursor::new(table);
        let _max_file_size = read_u64(&mut cur)?;
        let _file_count = read_u32(&mut cur)?;
        let entry_count = read_u32(&mut cur)? as usize;
        let mut entries = BTreeMap::new();
        for _ in 0..entry_count {
            let name = read_string(&mut cur)?;
            let file_index = read_u32(&mut cur)?;
            let start = read_u64(&mut cur)?;
            let end = read_u64(&mut cur)?;
            if end < start {
                return Err(MergeError::Corruption {
                    details: format!("Inverted blob range for [{}] in {:?}", name, meta_path),
                });
            }
            entries.insert(name, (file_index, start, end));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, MergeError> {
        let (file_index, start, end) = *self.entries.get(name).ok_or_else(|| {
            MergeError::Corruption {
                details: format!("Blob [{}] missing from container directory", name),
            }
        })?;
        let path = self.dir.join(chunk_file_name(file_index));
        let mut f = File::open(path)?;
        f.seek(SeekFrom::Start(start))?;
        let mut out = vec![0u8; (end - start) as usize];
        f.read_exact(&mut out)?;
        Ok(out)
    }
}
