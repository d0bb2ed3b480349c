use std::collections::VecDeque;
use std::fs::File;
use std::mem;
use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::errors::Result;
use crate::ring::record_len;

/// Producer-private FIFO for records a consumer ring had no room for.
///
/// Records stay in memory up to `limit` bytes. Past that everything new goes
/// to an anonymous temporary file until the file has been read back empty,
/// so the order in which records were pushed is kept across both tiers.
pub(crate) struct OverflowStore {
    memory: VecDeque<Vec<u8>>,
    memory_bytes: usize,
    limit: usize,
    spill: Option<SpillFile>,
    head: Option<Vec<u8>>,
    len: usize,
}

struct SpillFile {
    file: File,
    read_pos: u64,
    write_pos: u64,
}

impl SpillFile {
    fn new() -> Result<SpillFile> {
        Ok(SpillFile {
            file: tempfile::tempfile()?,
            read_pos: 0,
            write_pos: 0,
        })
    }

    fn append(&mut self, record: &[u8]) -> Result<()> {
        let len = record_len(record.len())?.to_ne_bytes();
        self.file.write_all_at(&len, self.write_pos)?;
        self.file.write_all_at(record, self.write_pos + len.len() as u64)?;
        self.write_pos += (len.len() + record.len()) as u64;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.is_drained() {
            return Ok(None);
        }
        let mut len = [0u8; mem::size_of::<u32>()];
        self.file.read_exact_at(&mut len, self.read_pos)?;
        let mut record = vec![0u8; u32::from_ne_bytes(len) as usize];
        self.file.read_exact_at(&mut record, self.read_pos + len.len() as u64)?;
        self.read_pos += (len.len() + record.len()) as u64;
        Ok(Some(record))
    }

    fn is_drained(&self) -> bool {
        self.read_pos == self.write_pos
    }
}

impl OverflowStore {
    pub fn new(limit: usize) -> OverflowStore {
        OverflowStore {
            memory: VecDeque::new(),
            memory_bytes: 0,
            limit,
            spill: None,
            head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn push(&mut self, record: &[u8]) -> Result<()> {
        match self.spill.as_mut() {
            Some(spill) => spill.append(record)?,
            None if self.memory_bytes + record.len() <= self.limit => {
                self.memory_bytes += record.len();
                self.memory.push_back(record.to_vec());
            }
            None => {
                debug!(
                    records = self.len,
                    bytes = self.memory_bytes,
                    "overflow store exceeds memory limit, spilling to file"
                );
                let mut spill = SpillFile::new()?;
                spill.append(record)?;
                self.spill = Some(spill);
            }
        }
        self.len += 1;
        Ok(())
    }

    /// Oldest record, left in place.
    pub fn front(&mut self) -> Result<Option<&[u8]>> {
        if self.memory.is_empty() && self.head.is_none() {
            if let Some(spill) = self.spill.as_mut() {
                self.head = spill.next()?;
            }
        }
        Ok(self.memory.front().map(Vec::as_slice).or(self.head.as_deref()))
    }

    pub fn pop_front(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(record) = self.memory.pop_front() {
            self.memory_bytes -= record.len();
            self.len -= 1;
            return Ok(Some(record));
        }
        let record = match self.head.take() {
            Some(record) => Some(record),
            None => match self.spill.as_mut() {
                Some(spill) => spill.next()?,
                None => None,
            },
        };
        if record.is_some() {
            self.len -= 1;
        }
        if self.spill.as_ref().map_or(false, SpillFile::is_drained) && self.head.is_none() {
            self.spill = None;
        }
        Ok(record)
    }
}
