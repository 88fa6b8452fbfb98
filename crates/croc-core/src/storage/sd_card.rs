use embedded_sdmmc::{BlockDevice, Mode, TimeSource, Timestamp, VolumeIdx, VolumeManager};
use log::error;

use super::{FileStore, StorageError};
use crate::time::{self, DateTime};

/// Map an embedded-sdmmc error, logging everything except a plain miss.
fn sd_err<E: core::fmt::Debug>(
    kind: StorageError,
    operation: &'static str,
) -> impl FnOnce(embedded_sdmmc::Error<E>) -> StorageError {
    move |e| match e {
        embedded_sdmmc::Error::NotFound => StorageError::NotFound,
        other => {
            error!("SD {} failed: {:?}", operation, other);
            kind
        }
    }
}

/// FAT timestamps for files we create. Without a live clock handle the
/// build time is the best available value.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildTimeSource;

impl TimeSource for BuildTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        let t = time::build_time_utc()
            .filter(|t| t.year >= 1970)
            .unwrap_or(DateTime::new(2025, 1, 1, 0, 0, 0));
        Timestamp {
            year_since_1970: (t.year - 1970) as u8,
            zero_indexed_month: t.month.saturating_sub(1),
            zero_indexed_day: t.day.saturating_sub(1),
            hours: t.hour,
            minutes: t.minute,
            seconds: t.second,
        }
    }
}

/// These SD card operations are blocking and run on the acquisition loop.
/// Every operation opens the volume, root directory and file, and closes
/// them again before returning.
pub struct SdCardStorage<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    volume_mgr: VolumeManager<D, T, 4, 4, 1>,
}

impl<D, T> SdCardStorage<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    pub fn new(block_device: D, ts: T) -> Self {
        let volume_mgr = VolumeManager::new(block_device, ts);

        Self { volume_mgr }
    }

    /// Check that the card has a readable FAT volume.
    pub fn mount(&mut self) -> Result<(), StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(sd_err(StorageError::OpenFailed, "open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(sd_err(StorageError::OpenFailed, "open root"))?;

        root_dir
            .close()
            .map_err(sd_err(StorageError::OpenFailed, "close root"))?;
        volume0
            .close()
            .map_err(sd_err(StorageError::OpenFailed, "close volume"))?;
        Ok(())
    }

    fn write_file(&mut self, name: &str, mode: Mode, data: &[u8]) -> Result<(), StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(sd_err(StorageError::OpenFailed, "open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(sd_err(StorageError::OpenFailed, "open root"))?;
        let file = root_dir
            .open_file_in_dir(name, mode)
            .map_err(sd_err(StorageError::OpenFailed, "open file"))?;

        if !data.is_empty() {
            file.write(data)
                .map_err(sd_err(StorageError::WriteFailed, "write"))?;
        }

        // Closing flushes the directory entry; report it as a write failure.
        file.close()
            .map_err(sd_err(StorageError::WriteFailed, "close file"))?;
        root_dir
            .close()
            .map_err(sd_err(StorageError::WriteFailed, "close root"))?;
        volume0
            .close()
            .map_err(sd_err(StorageError::WriteFailed, "close volume"))?;
        Ok(())
    }
}

impl<D, T> FileStore for SdCardStorage<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    fn size(&mut self, name: &str) -> Result<Option<u32>, StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(sd_err(StorageError::OpenFailed, "open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(sd_err(StorageError::OpenFailed, "open root"))?;

        let size = match root_dir.find_directory_entry(name) {
            Ok(entry) => Some(entry.size),
            Err(embedded_sdmmc::Error::NotFound) => None,
            Err(e) => return Err(sd_err(StorageError::ReadFailed, "find entry")(e)),
        };

        root_dir
            .close()
            .map_err(sd_err(StorageError::ReadFailed, "close root"))?;
        volume0
            .close()
            .map_err(sd_err(StorageError::ReadFailed, "close volume"))?;
        Ok(size)
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.write_file(name, Mode::ReadWriteCreateOrAppend, data)
    }

    fn read_at(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(sd_err(StorageError::OpenFailed, "open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(sd_err(StorageError::OpenFailed, "open root"))?;
        let file = root_dir
            .open_file_in_dir(name, Mode::ReadOnly)
            .map_err(sd_err(StorageError::OpenFailed, "open file"))?;

        let mut count = 0;
        if offset < file.length() {
            file.seek_from_start(offset)
                .map_err(sd_err(StorageError::ReadFailed, "seek"))?;
            while count < buf.len() {
                let n = file
                    .read(&mut buf[count..])
                    .map_err(sd_err(StorageError::ReadFailed, "read"))?;
                if n == 0 {
                    break; // EOF
                }
                count += n;
            }
        }

        file.close()
            .map_err(sd_err(StorageError::ReadFailed, "close file"))?;
        root_dir
            .close()
            .map_err(sd_err(StorageError::ReadFailed, "close root"))?;
        volume0
            .close()
            .map_err(sd_err(StorageError::ReadFailed, "close volume"))?;
        Ok(count)
    }

    fn create_truncated(&mut self, name: &str) -> Result<(), StorageError> {
        self.write_file(name, Mode::ReadWriteCreateOrTruncate, &[])
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(sd_err(StorageError::OpenFailed, "open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(sd_err(StorageError::OpenFailed, "open root"))?;

        root_dir
            .delete_file_in_dir(name)
            .map_err(sd_err(StorageError::WriteFailed, "delete"))?;

        root_dir
            .close()
            .map_err(sd_err(StorageError::WriteFailed, "close root"))?;
        volume0
            .close()
            .map_err(sd_err(StorageError::WriteFailed, "close volume"))?;
        Ok(())
    }

    /// Files are closed after every operation, so there is nothing buffered.
    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
