//! Host directory standing in for the SD card.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use croc_core::storage::{FileStore, StorageError, file_name};

pub struct DirFileStore {
    root: PathBuf,
}

impl DirFileStore {
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, name: &str) -> Result<PathBuf, StorageError> {
        let name = file_name(name)?;
        Ok(self.root.join(name.as_str()))
    }
}

fn not_found_or(e: io::Error, other: StorageError) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound
    } else {
        other
    }
}

impl FileStore for DirFileStore {
    fn size(&mut self, name: &str) -> Result<Option<u32>, StorageError> {
        match fs::metadata(self.path(name)?) {
            Ok(meta) => Ok(Some(meta.len().min(u64::from(u32::MAX)) as u32)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(_) => Err(StorageError::OpenFailed),
        }
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name)?)
            .map_err(|_| StorageError::OpenFailed)?;
        file.write_all(data).map_err(|_| StorageError::WriteFailed)
    }

    fn read_at(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        let mut file =
            File::open(self.path(name)?).map_err(|e| not_found_or(e, StorageError::OpenFailed))?;
        file.seek(SeekFrom::Start(u64::from(offset)))
            .map_err(|_| StorageError::ReadFailed)?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return Err(StorageError::ReadFailed),
            }
        }
        Ok(filled)
    }

    fn create_truncated(&mut self, name: &str) -> Result<(), StorageError> {
        File::create(self.path(name)?)
            .map(drop)
            .map_err(|_| StorageError::OpenFailed)
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        fs::remove_file(self.path(name)?).map_err(|e| not_found_or(e, StorageError::WriteFailed))
    }

    /// Every operation opens and closes its file, so there is nothing buffered.
    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn replace(&mut self, source: &str, target: &str) -> Result<(), StorageError> {
        fs::rename(self.path(source)?, self.path(target)?)
            .map_err(|e| not_found_or(e, StorageError::WriteFailed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> DirFileStore {
        let dir = std::env::temp_dir().join(format!("croc-sim-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        DirFileStore::open(dir).unwrap()
    }

    #[test]
    fn test_append_and_read_back() {
        let mut store = scratch("append");
        assert_eq!(store.size("LOG.TXT").unwrap(), None);

        store.append("LOG.TXT", b"hello ").unwrap();
        store.append("LOG.TXT", b"world").unwrap();
        assert_eq!(store.size("LOG.TXT").unwrap(), Some(11));

        let mut buf = [0u8; 32];
        let n = store.read_at("LOG.TXT", 6, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn test_replace_renames() {
        let mut store = scratch("replace");
        store.append("A.TMP", b"new").unwrap();
        store.append("A.BIN", b"old contents").unwrap();

        store.replace("A.TMP", "A.BIN").unwrap();

        assert!(!store.exists("A.TMP").unwrap());
        let mut buf = [0u8; 16];
        let n = store.read_at("A.BIN", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"new");
    }

    #[test]
    fn test_missing_file_and_bad_name() {
        let mut store = scratch("missing");
        assert_eq!(store.remove("NONE.TXT"), Err(StorageError::NotFound));
        assert_eq!(
            store.append("far-too-long-name.txt", b"x"),
            Err(StorageError::InvalidName)
        );
    }
}
