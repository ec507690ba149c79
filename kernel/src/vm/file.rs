//! The file interface pages are loaded from.

use crate::sync::mutex::Mutex;
use alloc::{sync::Arc, vec::Vec};

/// A file open for reading, with a cursor.
pub trait File {
    /// Moves the cursor to byte `offset`.
    fn seek(&mut self, offset: usize);

    /// Reads up to `buf.len()` bytes at the cursor and advances it. Returns the
    /// number of bytes read, which is short only at end of file.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// A file shared between the pages it backs. Every page load locks it for
/// the seek-then-read pair.
pub type FileRef = Arc<Mutex<dyn File + Send>>;

/// A file held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemFile {
    data: Vec<u8>,
    pos: usize,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn into_ref(self) -> FileRef {
        Arc::new(Mutex::new(self))
    }
}

impl File for MemFile {
    fn seek(&mut self, offset: usize) {
        self.pos = offset;
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let start = self.pos.min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos = start + n;
        n
    }
}
