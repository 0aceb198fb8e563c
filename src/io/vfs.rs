//! The storage seam under the I/O queue.
//!
//! The queue's command semantics (ordering, fences, buffer ownership) are
//! fixed; only where the bytes live is pluggable. `FsVfs` maps bucket files
//! into a working directory with buffered readers/writers; `MemVfs` keeps
//! them in shared memory and backs every test in this crate.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// One open bucket file: positioned byte stream, read/write/seek.
pub trait VfsFile: Send {
    fn read_exact_buf(&mut self, buf: &mut [u8]) -> io::Result<()>;
    fn write_all_buf(&mut self, buf: &[u8]) -> io::Result<()>;
    fn seek_to(&mut self, pos: SeekFrom) -> io::Result<u64>;
    fn flush_file(&mut self) -> io::Result<()>;
}

/// A namespace of bucket files.
pub trait Vfs: Send {
    /// Opens (creating if absent) the named file, positioned at the start.
    fn open(&self, name: &str) -> io::Result<Box<dyn VfsFile>>;
    /// Removes the named file. Removing a missing file is an error.
    fn remove(&self, name: &str) -> io::Result<()>;
    /// Device alignment requirement; buffered backends report 1.
    fn block_size(&self) -> usize {
        1
    }
}

//==================================================================================
// 1. Filesystem backend
//==================================================================================

/// Bucket files under a working directory on the local filesystem.
pub struct FsVfs {
    root: PathBuf,
}

impl FsVfs {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

impl Vfs for FsVfs {
    fn open(&self, name: &str) -> io::Result<Box<dyn VfsFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.root.join(name))?;
        Ok(Box::new(FsFile { file }))
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        std::fs::remove_file(self.root.join(name))
    }
}

struct FsFile {
    file: File,
}

impl VfsFile for FsFile {
    fn read_exact_buf(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact(buf)
    }

    fn write_all_buf(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    fn seek_to(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn flush_file(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

//==================================================================================
// 2. In-memory backend
//==================================================================================

type MemStore = Arc<Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>>;

/// Shared in-memory bucket files. Clones see the same namespace, which lets
/// a test keep a handle while the queue's agent owns another.
#[derive(Clone, Default)]
pub struct MemVfs {
    store: MemStore,
}

impl MemVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full contents of a file, or `None` if it was never created.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap()
            .get(name)
            .map(|data| data.lock().unwrap().clone())
    }

    /// Creates or replaces a file wholesale (test fixtures).
    pub fn put(&self, name: &str, bytes: Vec<u8>) {
        self.store
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(Mutex::new(bytes)));
    }

    pub fn exists(&self, name: &str) -> bool {
        self.store.lock().unwrap().contains_key(name)
    }

    /// All file names currently in the namespace, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.store.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Vfs for MemVfs {
    fn open(&self, name: &str) -> io::Result<Box<dyn VfsFile>> {
        let data = self
            .store
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        Ok(Box::new(MemFile { data, pos: 0 }))
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.store
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
}

impl VfsFile for MemFile {
    fn read_exact_buf(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock().unwrap();
        let mut cursor = Cursor::new(&data[..]);
        cursor.set_position(self.pos);
        cursor.read_exact(buf)?;
        self.pos = cursor.position();
        Ok(())
    }

    fn write_all_buf(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        let end = self.pos as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.pos as usize..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(())
    }

    fn seek_to(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().unwrap().len() as i64;
        let new = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        if new < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = new as u64;
        Ok(self.pos)
    }

    fn flush_file(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//==================================================================================
// 3. Unit Tests
//==================================================================================
