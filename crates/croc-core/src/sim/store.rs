use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::storage::{FileStore, StorageError};

/// Operations that can be made to fail with [`MemFileStore::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StoreFault {
    Append,
    Read,
    Create,
    Remove,
    Replace,
    Flush,
}

/// In-memory [`FileStore`] with rename-style `replace` and counted fault
/// injection.
#[derive(Debug, Default)]
pub struct MemFileStore {
    files: BTreeMap<String, Vec<u8>>,
    /// Remaining failures per operation.
    faults: BTreeMap<StoreFault, u32>,
    flushes: u32,
}

impl MemFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, contents: &[u8]) {
        self.files.insert(name.to_string(), contents.to_vec());
    }

    pub fn contents(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn flush_count(&self) -> u32 {
        self.flushes
    }

    /// Make the next operation of this kind fail.
    pub fn fail_next(&mut self, fault: StoreFault) {
        self.fail_times(fault, 1);
    }

    /// Make the next `times` operations of this kind fail.
    pub fn fail_times(&mut self, fault: StoreFault, times: u32) {
        if times == 0 {
            self.faults.remove(&fault);
        } else {
            self.faults.insert(fault, times);
        }
    }

    fn check(&mut self, fault: StoreFault, error: StorageError) -> Result<(), StorageError> {
        let Some(left) = self.faults.get_mut(&fault) else {
            return Ok(());
        };
        *left -= 1;
        if *left == 0 {
            self.faults.remove(&fault);
        }
        Err(error)
    }
}

impl FileStore for MemFileStore {
    fn size(&mut self, name: &str) -> Result<Option<u32>, StorageError> {
        Ok(self.files.get(name).map(|f| f.len() as u32))
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.check(StoreFault::Append, StorageError::WriteFailed)?;
        self.files
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn read_at(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.check(StoreFault::Read, StorageError::ReadFailed)?;
        let file = self.files.get(name).ok_or(StorageError::NotFound)?;
        let start = (offset as usize).min(file.len());
        let n = buf.len().min(file.len() - start);
        buf[..n].copy_from_slice(&file[start..start + n]);
        Ok(n)
    }

    fn create_truncated(&mut self, name: &str) -> Result<(), StorageError> {
        self.check(StoreFault::Create, StorageError::OpenFailed)?;
        self.files.insert(name.to_string(), Vec::new());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        self.check(StoreFault::Remove, StorageError::WriteFailed)?;
        self.files
            .remove(name)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.check(StoreFault::Flush, StorageError::WriteFailed)?;
        self.flushes += 1;
        Ok(())
    }

    fn replace(&mut self, source: &str, target: &str) -> Result<(), StorageError> {
        self.check(StoreFault::Replace, StorageError::WriteFailed)?;
        let contents = self.files.remove(source).ok_or(StorageError::NotFound)?;
        self.files.insert(target.to_string(), contents);
        Ok(())
    }
}
