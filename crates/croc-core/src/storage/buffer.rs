//! Fixed-capacity RAM buffer for batch logging

use alloc::vec::Vec;

use heapless::Vec as HVec;
use log::{debug, warn};

use super::{FileStore, LogWriter, StorageError};
use crate::record::SampleRecord;

pub const DEFAULT_CAPACITY: usize = 60;
/// `is_almost_full` triggers this many slots before capacity.
const ALMOST_FULL_MARGIN: usize = 5;

/// Insertion-ordered records awaiting a drain. A push into a full buffer
/// is dropped and counted; stored records are never overwritten.
pub struct RecordBuffer<const N: usize = DEFAULT_CAPACITY> {
    records: HVec<SampleRecord, N>,
    dropped: u32,
    drained: u32,
    high_water: usize,
}

impl<const N: usize> Default for RecordBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RecordBuffer<N> {
    pub const fn new() -> Self {
        Self {
            records: HVec::new(),
            dropped: 0,
            drained: 0,
            high_water: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_almost_full(&self) -> bool {
        self.records.len() >= N.saturating_sub(ALMOST_FULL_MARGIN)
    }

    /// Records rejected because the buffer was full.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Total records written out by `drain`.
    pub fn drained(&self) -> u32 {
        self.drained
    }

    /// Most records held at once.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    /// Returns `false` (and counts the drop) when full.
    pub fn push(&mut self, record: SampleRecord) -> bool {
        match self.records.push(record) {
            Ok(()) => {
                self.high_water = self.high_water.max(self.records.len());
                true
            }
            Err(_) => {
                self.dropped += 1;
                warn!("record buffer full, {} dropped so far", self.dropped);
                false
            }
        }
    }

    /// Write every buffered record to `log` in insertion order with a single
    /// append, flush, then empty the buffer. On error nothing is removed.
    pub fn drain(
        &mut self,
        log: &mut LogWriter,
        store: &mut impl FileStore,
    ) -> Result<usize, StorageError> {
        let count = self.records.len();
        if count == 0 {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(count * 160);
        for record in &self.records {
            let row = record
                .to_csv_row()
                .map_err(|_| StorageError::WriteFailed)?;
            batch.extend_from_slice(row.as_bytes());
        }

        log.append_rows(store, &batch, count as u32)?;
        log.flush(store)?;

        self.records.clear();
        self.drained += count as u32;
        debug!("drained {} records to {}", count, log.name());
        Ok(count)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
