//! Log storage on the removable card
//!
//! Everything above this module talks to a [`FileStore`]: a flat root
//! directory of 8.3 names with append, positioned read, truncate, delete and
//! replace. The SD card implementation opens and closes the file on every
//! operation, so nothing is left half-open if the card is pulled.

pub mod buffer;
pub mod sd_card;

pub use buffer::RecordBuffer;
pub use sd_card::{BuildTimeSource, SdCardStorage};

use core::fmt::Write as _;

use heapless::String;
use log::{error, info, warn};
use thiserror_no_std::Error;

use crate::error::TrackerError;

/// Scratch file used by [`shift_prefix`]. Removed again at startup if a reset
/// interrupted a shift.
pub const TEMP_FILE: &str = "TEMP.TXT";
/// Written once [`TEMP_FILE`] holds a complete remainder. Holds the name of
/// the file being shifted.
pub const SHIFT_JOURNAL_FILE: &str = "SHIFT.JNL";
pub const DATA_LOG_FILE: &str = "CROCLOG.CSV";
/// Compact per-fix log that feeds the satellite link.
pub const FIX_LOG_FILE: &str = "IRID_DAT.TXT";
pub const CONFIG_FILE: &str = "CONFIG.BIN";

/// Longest 8.3 name, `NNNNNNNN.EEE`.
pub const MAX_NAME_LEN: usize = 12;
pub type FileName = String<MAX_NAME_LEN>;

const COPY_CHUNK: usize = 128;
const ROTATION_NAME_ATTEMPTS: u32 = 16;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("file not found")]
    NotFound,
    #[error("file name is not 8.3")]
    InvalidName,
    #[error("open failed")]
    OpenFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("read failed")]
    ReadFailed,
    #[error("prefix shift failed")]
    ShiftFailed,
}

impl From<StorageError> for TrackerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound | StorageError::InvalidName | StorageError::OpenFailed => {
                TrackerError::StorageOpenFailed
            }
            StorageError::WriteFailed => TrackerError::StorageWriteFailed,
            StorageError::ReadFailed => TrackerError::StorageReadFailed,
            StorageError::ShiftFailed => TrackerError::StorageShiftFailed,
        }
    }
}

/// Flat file system in the card's root directory.
pub trait FileStore {
    /// Size in bytes, or `None` if the file does not exist.
    fn size(&mut self, name: &str) -> Result<Option<u32>, StorageError>;

    /// Append to the end of the file, creating it if needed.
    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Read from `offset`. Returns the number of bytes read, short at end of file.
    fn read_at(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Create the file, or truncate it to zero length if it exists.
    fn create_truncated(&mut self, name: &str) -> Result<(), StorageError>;

    fn remove(&mut self, name: &str) -> Result<(), StorageError>;

    fn flush(&mut self) -> Result<(), StorageError>;

    /// Replace `target` with the contents of `source` and remove `source`.
    ///
    /// The default copies the bytes across, for file systems without rename.
    fn replace(&mut self, source: &str, target: &str) -> Result<(), StorageError> {
        self.create_truncated(target)?;
        copy_range(self, source, 0, target)?;
        self.flush()?;
        self.remove(source)
    }

    fn exists(&mut self, name: &str) -> Result<bool, StorageError> {
        Ok(self.size(name)?.is_some())
    }
}

pub fn file_name(name: &str) -> Result<FileName, StorageError> {
    let (stem, ext) = name.split_once('.').unwrap_or((name, ""));
    if stem.is_empty() || stem.len() > 8 || ext.len() > 3 || ext.contains('.') {
        return Err(StorageError::InvalidName);
    }
    FileName::try_from(name).map_err(|_| StorageError::InvalidName)
}

/// Append `source[offset..]` to `target`. Returns bytes copied.
fn copy_range<S: FileStore + ?Sized>(
    store: &mut S,
    source: &str,
    mut offset: u32,
    target: &str,
) -> Result<u32, StorageError> {
    let mut chunk = [0u8; COPY_CHUNK];
    let mut copied = 0u32;
    loop {
        let n = store.read_at(source, offset, &mut chunk)?;
        if n == 0 {
            return Ok(copied);
        }
        store.append(target, &chunk[..n])?;
        offset += n as u32;
        copied += n as u32;
    }
}

/// Remove the first `n` bytes of `name`, keeping the rest byte for byte.
///
/// The remainder is staged in [`TEMP_FILE`], then [`SHIFT_JOURNAL_FILE`] is
/// written with the target's name and the remainder is swapped in. A failure
/// before the journal exists leaves the original untouched. A swap that fails
/// twice and has already truncated the target keeps both files so
/// [`recover_after_reset`] can finish it. Returns the new size.
pub fn shift_prefix<S: FileStore + ?Sized>(
    store: &mut S,
    name: &str,
    n: u32,
) -> Result<u32, StorageError> {
    if let Err(e) = finish_interrupted_shift(store) {
        warn!("shift {}: leftover staging could not be resolved: {}", name, e);
        return Err(StorageError::ShiftFailed);
    }

    let size = store.size(name)?.ok_or(StorageError::NotFound)?;
    if n == 0 {
        return Ok(size);
    }
    if n >= size {
        store.create_truncated(name)?;
        return Ok(0);
    }

    let staged = store
        .create_truncated(TEMP_FILE)
        .and_then(|()| copy_range(store, name, n, TEMP_FILE))
        .and_then(|copied| {
            if copied == size - n {
                store.flush()
            } else {
                Err(StorageError::ReadFailed)
            }
        })
        .and_then(|()| write_journal(store, name));
    if let Err(e) = staged {
        warn!("shift {}: staging remainder failed: {}", name, e);
        discard_staging(store);
        return Err(StorageError::ShiftFailed);
    }

    if let Err(e) = store.replace(TEMP_FILE, name) {
        warn!("shift {}: replace failed: {}, retrying", name, e);
        if let Err(e) = store.replace(TEMP_FILE, name) {
            // A target still at its old size was never touched.
            if store.size(name) == Ok(Some(size)) {
                warn!("shift {}: replace failed again: {}", name, e);
                discard_staging(store);
            } else {
                error!(
                    "shift {}: replace failed again: {}, remainder kept in {}",
                    name, e, TEMP_FILE
                );
            }
            return Err(StorageError::ShiftFailed);
        }
    }

    if let Err(e) = store.remove(SHIFT_JOURNAL_FILE) {
        warn!("shift {}: journal not removed: {}", name, e);
    }
    Ok(size - n)
}

fn write_journal<S: FileStore + ?Sized>(store: &mut S, target: &str) -> Result<(), StorageError> {
    store.create_truncated(SHIFT_JOURNAL_FILE)?;
    store.append(SHIFT_JOURNAL_FILE, target.as_bytes())?;
    store.flush()
}

/// Target named by the journal, or `None` if there is no journal or it was
/// cut short before the staging was committed.
fn read_journal<S: FileStore + ?Sized>(store: &mut S) -> Result<Option<FileName>, StorageError> {
    let Some(len) = store.size(SHIFT_JOURNAL_FILE)? else {
        return Ok(None);
    };
    let mut buf = [0u8; MAX_NAME_LEN];
    if len as usize > buf.len() {
        return Ok(None);
    }
    let n = store.read_at(SHIFT_JOURNAL_FILE, 0, &mut buf)?;
    Ok(core::str::from_utf8(&buf[..n])
        .ok()
        .and_then(|name| file_name(name).ok()))
}

fn discard_staging<S: FileStore + ?Sized>(store: &mut S) {
    for staging in [SHIFT_JOURNAL_FILE, TEMP_FILE] {
        match store.remove(staging) {
            Ok(()) | Err(StorageError::NotFound) => {}
            Err(e) => warn!("could not remove {}: {}", staging, e),
        }
    }
}

/// Complete a committed shift, or drop an uncommitted one.
fn finish_interrupted_shift<S: FileStore + ?Sized>(store: &mut S) -> Result<(), StorageError> {
    let has_temp = store.exists(TEMP_FILE)?;
    match read_journal(store)? {
        Some(target) if has_temp => {
            warn!("completing interrupted shift of {}", target);
            store.replace(TEMP_FILE, &target)?;
            store.remove(SHIFT_JOURNAL_FILE)?;
        }
        _ => {
            if store.exists(SHIFT_JOURNAL_FILE)? {
                store.remove(SHIFT_JOURNAL_FILE)?;
            }
            if has_temp {
                warn!("removing stale {} left by an interrupted shift", TEMP_FILE);
                store.remove(TEMP_FILE)?;
            }
        }
    }
    Ok(())
}

/// Startup cleanup after an unexpected reset.
pub fn recover_after_reset<S: FileStore + ?Sized>(store: &mut S) -> Result<(), StorageError> {
    finish_interrupted_shift(store)
}

/// Handle on an append-only log. The header, if any, is written when the
/// file is empty at open.
#[derive(Debug, Clone)]
pub struct LogWriter {
    name: FileName,
    header: Option<&'static str>,
    open: bool,
    rows_written: u32,
}

impl LogWriter {
    pub fn new(name: &str, header: Option<&'static str>) -> Result<Self, StorageError> {
        Ok(Self {
            name: file_name(name)?,
            header,
            open: false,
            rows_written: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn rows_written(&self) -> u32 {
        self.rows_written
    }

    pub fn open(&mut self, store: &mut impl FileStore) -> Result<(), StorageError> {
        if self.open {
            return Ok(());
        }
        let size = store.size(&self.name)?.unwrap_or(0);
        if size == 0 {
            match self.header {
                Some(header) => {
                    store.append(&self.name, header.as_bytes())?;
                    store.append(&self.name, b"\n")?;
                }
                None => store.create_truncated(&self.name)?,
            }
            info!("created {}", self.name);
        }
        self.open = true;
        Ok(())
    }

    /// Append one LF-terminated row. Opens the log first if needed.
    pub fn append(&mut self, store: &mut impl FileStore, row: &[u8]) -> Result<(), StorageError> {
        self.open(store)?;
        store.append(&self.name, row)?;
        self.rows_written += 1;
        Ok(())
    }

    /// Append `count` pre-formatted rows in a single write.
    pub fn append_rows(
        &mut self,
        store: &mut impl FileStore,
        rows: &[u8],
        count: u32,
    ) -> Result<(), StorageError> {
        self.open(store)?;
        store.append(&self.name, rows)?;
        self.rows_written += count;
        Ok(())
    }

    pub fn flush(&mut self, store: &mut impl FileStore) -> Result<(), StorageError> {
        store.flush()
    }

    pub fn close(&mut self, store: &mut impl FileStore) -> Result<(), StorageError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        store.flush()
    }

    pub fn size(&self, store: &mut impl FileStore) -> Result<u64, StorageError> {
        Ok(u64::from(store.size(&self.name)?.unwrap_or(0)))
    }

    /// Move the log aside to `IR#####.TXT` once it exceeds `threshold` bytes.
    /// The next append starts a fresh log. Returns the rotated name.
    pub fn rotate_if_larger(
        &mut self,
        store: &mut impl FileStore,
        threshold: u32,
        uptime_s: u32,
    ) -> Result<Option<FileName>, StorageError> {
        let size = store.size(&self.name)?.unwrap_or(0);
        if size <= threshold {
            return Ok(None);
        }
        self.close(store)?;

        let mut backup = FileName::new();
        for attempt in 0..ROTATION_NAME_ATTEMPTS {
            backup.clear();
            let _ = write!(backup, "IR{:05}.TXT", (uptime_s + attempt) % 100_000);
            if !store.exists(&backup)? {
                store.replace(&self.name, &backup)?;
                info!("rotated {} ({} bytes) to {}", self.name, size, backup);
                return Ok(Some(backup));
            }
        }
        Err(StorageError::OpenFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MemFileStore, StoreFault};

    #[test]
    fn test_file_name_rules() {
        assert!(file_name("CROCLOG.CSV").is_ok());
        assert!(file_name("IR00042.TXT").is_ok());
        assert_eq!(file_name("TOOLONGNAME.CSV"), Err(StorageError::InvalidName));
        assert_eq!(file_name("A.CSVX"), Err(StorageError::InvalidName));
        assert_eq!(file_name(".CSV"), Err(StorageError::InvalidName));
    }

    #[test]
    fn test_shift_prefix_example() {
        let mut store = MemFileStore::new();
        store.insert("LOG.CSV", b"A,B,C\nD,E,F\n");

        assert_eq!(shift_prefix(&mut store, "LOG.CSV", 6), Ok(6));
        assert_eq!(store.contents("LOG.CSV"), Some(&b"D,E,F\n"[..]));
        assert!(store.contents(TEMP_FILE).is_none());
    }

    #[test]
    fn test_shift_prefix_preserves_suffix() {
        let original: alloc::vec::Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for n in [1u32, 95, 128, 129, 500, 999] {
            let mut store = MemFileStore::new();
            store.insert("LOG.CSV", &original);
            assert_eq!(shift_prefix(&mut store, "LOG.CSV", n), Ok(1000 - n));
            assert_eq!(store.contents("LOG.CSV"), Some(&original[n as usize..]));
        }
    }

    #[test]
    fn test_shift_whole_file_and_zero() {
        let mut store = MemFileStore::new();
        store.insert("LOG.CSV", b"abc");
        assert_eq!(shift_prefix(&mut store, "LOG.CSV", 0), Ok(3));
        assert_eq!(shift_prefix(&mut store, "LOG.CSV", 10), Ok(0));
        assert_eq!(store.contents("LOG.CSV"), Some(&b""[..]));
        assert_eq!(shift_prefix(&mut store, "NOPE.CSV", 1), Err(StorageError::NotFound));
    }

    #[test]
    fn test_shift_replace_retried_once() {
        let mut store = MemFileStore::new();
        store.insert("LOG.CSV", b"A,B,C\nD,E,F\n");
        store.fail_next(StoreFault::Replace);

        assert_eq!(shift_prefix(&mut store, "LOG.CSV", 6), Ok(6));
        assert_eq!(store.contents("LOG.CSV"), Some(&b"D,E,F\n"[..]));
        assert!(store.contents(TEMP_FILE).is_none());
        assert!(store.contents(SHIFT_JOURNAL_FILE).is_none());
    }

    #[test]
    fn test_shift_replace_failure_leaves_original() {
        let mut store = MemFileStore::new();
        store.insert("LOG.CSV", b"A,B,C\nD,E,F\n");
        store.fail_times(StoreFault::Replace, 2);

        assert_eq!(
            shift_prefix(&mut store, "LOG.CSV", 6),
            Err(StorageError::ShiftFailed)
        );
        assert_eq!(store.contents("LOG.CSV"), Some(&b"A,B,C\nD,E,F\n"[..]));
        assert!(store.contents(TEMP_FILE).is_none());
        assert!(store.contents(SHIFT_JOURNAL_FILE).is_none());
    }

    #[test]
    fn test_shift_staging_failure_leaves_original() {
        let mut store = MemFileStore::new();
        store.insert("LOG.CSV", b"A,B,C\nD,E,F\n");
        store.fail_next(StoreFault::Append);

        assert_eq!(
            shift_prefix(&mut store, "LOG.CSV", 6),
            Err(StorageError::ShiftFailed)
        );
        assert_eq!(store.contents("LOG.CSV"), Some(&b"A,B,C\nD,E,F\n"[..]));
        assert!(store.contents(TEMP_FILE).is_none());
        assert!(store.contents(SHIFT_JOURNAL_FILE).is_none());
    }

    /// Uses the trait's copying `replace`. Appends to `broken` fail while
    /// `failing_appends` is non-zero.
    struct CopyBackStore {
        inner: MemFileStore,
        broken: &'static str,
        failing_appends: u32,
    }

    impl CopyBackStore {
        fn new(inner: MemFileStore) -> Self {
            Self {
                inner,
                broken: "",
                failing_appends: 0,
            }
        }
    }

    impl FileStore for CopyBackStore {
        fn size(&mut self, name: &str) -> Result<Option<u32>, StorageError> {
            self.inner.size(name)
        }
        fn append(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
            if name == self.broken && self.failing_appends > 0 {
                self.failing_appends -= 1;
                return Err(StorageError::WriteFailed);
            }
            self.inner.append(name, data)
        }
        fn read_at(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
            self.inner.read_at(name, offset, buf)
        }
        fn create_truncated(&mut self, name: &str) -> Result<(), StorageError> {
            self.inner.create_truncated(name)
        }
        fn remove(&mut self, name: &str) -> Result<(), StorageError> {
            self.inner.remove(name)
        }
        fn flush(&mut self) -> Result<(), StorageError> {
            self.inner.flush()
        }
    }

    fn long_log() -> alloc::vec::Vec<u8> {
        (0..300u16).map(|i| i as u8).collect()
    }

    #[test]
    fn test_default_replace_copies() {
        let mut store = CopyBackStore::new(MemFileStore::new());
        let long = long_log();
        store.inner.insert("LOG.CSV", &long);
        assert_eq!(shift_prefix(&mut store, "LOG.CSV", 7), Ok(293));
        assert_eq!(store.inner.contents("LOG.CSV"), Some(&long[7..]));
        assert!(store.inner.contents(TEMP_FILE).is_none());
        assert!(store.inner.contents(SHIFT_JOURNAL_FILE).is_none());
    }

    #[test]
    fn test_copy_back_failure_retried() {
        let mut store = CopyBackStore::new(MemFileStore::new());
        let long = long_log();
        store.inner.insert("LOG.CSV", &long);
        // The first chunk written back into the truncated log fails.
        store.broken = "LOG.CSV";
        store.failing_appends = 1;

        assert_eq!(shift_prefix(&mut store, "LOG.CSV", 7), Ok(293));
        assert_eq!(store.inner.contents("LOG.CSV"), Some(&long[7..]));
        assert!(store.inner.contents(TEMP_FILE).is_none());
    }

    #[test]
    fn test_copy_back_failure_keeps_remainder_for_recovery() {
        let mut store = CopyBackStore::new(MemFileStore::new());
        let long = long_log();
        store.inner.insert("LOG.CSV", &long);
        store.broken = "LOG.CSV";
        store.failing_appends = u32::MAX;

        assert_eq!(
            shift_prefix(&mut store, "LOG.CSV", 7),
            Err(StorageError::ShiftFailed)
        );
        // The log was truncated by the copy, the remainder survives.
        assert_eq!(store.inner.contents("LOG.CSV"), Some(&b""[..]));
        assert_eq!(store.inner.contents(TEMP_FILE), Some(&long[7..]));
        assert_eq!(
            store.inner.contents(SHIFT_JOURNAL_FILE),
            Some(&b"LOG.CSV"[..])
        );

        store.failing_appends = 0;
        recover_after_reset(&mut store).unwrap();
        assert_eq!(store.inner.contents("LOG.CSV"), Some(&long[7..]));
        assert!(store.inner.contents(TEMP_FILE).is_none());
        assert!(store.inner.contents(SHIFT_JOURNAL_FILE).is_none());
    }

    #[test]
    fn test_next_shift_finishes_pending_one() {
        let mut store = MemFileStore::new();
        store.insert("LOG.CSV", b"");
        store.insert(TEMP_FILE, b"D,E,F\nG,H,I\n");
        store.insert(SHIFT_JOURNAL_FILE, b"LOG.CSV");

        assert_eq!(shift_prefix(&mut store, "LOG.CSV", 6), Ok(6));
        assert_eq!(store.contents("LOG.CSV"), Some(&b"G,H,I\n"[..]));
        assert!(store.contents(SHIFT_JOURNAL_FILE).is_none());
    }

    #[test]
    fn test_recovery_removes_temp() {
        let mut store = MemFileStore::new();
        store.insert(TEMP_FILE, b"half");
        store.insert("LOG.CSV", b"x\n");
        recover_after_reset(&mut store).unwrap();
        assert!(store.contents(TEMP_FILE).is_none());
        assert_eq!(store.contents("LOG.CSV"), Some(&b"x\n"[..]));
        recover_after_reset(&mut store).unwrap();
    }

    #[test]
    fn test_recovery_drops_cut_short_journal() {
        let mut store = MemFileStore::new();
        store.insert("LOG.CSV", b"x\n");
        store.insert(TEMP_FILE, b"half");
        store.insert(SHIFT_JOURNAL_FILE, b"LOG.C\xff");
        recover_after_reset(&mut store).unwrap();
        assert_eq!(store.contents("LOG.CSV"), Some(&b"x\n"[..]));
        assert!(store.contents(TEMP_FILE).is_none());
        assert!(store.contents(SHIFT_JOURNAL_FILE).is_none());

        store.insert(SHIFT_JOURNAL_FILE, b"LOG.CSV");
        recover_after_reset(&mut store).unwrap();
        assert_eq!(store.contents("LOG.CSV"), Some(&b"x\n"[..]));
        assert!(store.contents(SHIFT_JOURNAL_FILE).is_none());
    }

    #[test]
    fn test_header_written_once() {
        let mut store = MemFileStore::new();
        let mut log = LogWriter::new("LOG.CSV", Some("a,b")).unwrap();
        log.append(&mut store, b"1,2\n").unwrap();
        log.close(&mut store).unwrap();

        let mut reopened = LogWriter::new("LOG.CSV", Some("a,b")).unwrap();
        reopened.append(&mut store, b"3,4\n").unwrap();
        assert_eq!(store.contents("LOG.CSV"), Some(&b"a,b\n1,2\n3,4\n"[..]));
        assert_eq!(reopened.size(&mut store), Ok(12));
    }

    #[test]
    fn test_rotation() {
        let mut store = MemFileStore::new();
        let mut log = LogWriter::new(FIX_LOG_FILE, None).unwrap();
        log.append(&mut store, b"0123456789\n").unwrap();
        assert_eq!(log.rotate_if_larger(&mut store, 190, 42), Ok(None));

        for _ in 0..20 {
            log.append(&mut store, b"0123456789\n").unwrap();
        }
        store.insert("IR00042.TXT", b"older");
        let rotated = log.rotate_if_larger(&mut store, 190, 42).unwrap().unwrap();
        assert_eq!(rotated.as_str(), "IR00043.TXT");
        assert_eq!(store.contents("IR00043.TXT").map(<[u8]>::len), Some(231));
        assert!(store.contents(FIX_LOG_FILE).is_none());
        assert!(!log.is_open());

        log.append(&mut store, b"x\n").unwrap();
        assert_eq!(store.contents(FIX_LOG_FILE), Some(&b"x\n"[..]));
    }
}
