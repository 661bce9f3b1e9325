//! The table engine of spec.md §4.9: per-instance double-buffered table
//! storage, with a try-lock write-mutex enforcing a single writer and a
//! read-write lock publishing a completed write atomically.
//!
//! The teacher's Design Notes (§9) call out the source's "container-of"
//! recovery of the enclosing `table_state` from a `table_block` pointer as
//! something a neutral rewrite should avoid by threading an explicit
//! back-reference instead. Here there is no separate "writer" handle object
//! at all — the class that owns a `TableBlock` calls its
//! `open_write`/`write_line`/`close_write` methods directly, keyed by
//! instance, so there is nothing to recover a back-reference from.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sync::Mutex;
use sync::RwLock;

use crate::change::ChangeClock;
use crate::error::CommandError;
use crate::error::CommandResult;
use crate::hardware::HardwareBackend;

#[derive(Debug, Clone, Copy)]
pub enum TableCapacity {
    /// `max_length` words, parsed at register-binding time.
    Short { max_length: u32 },
    /// `2^order` words, directly addressable for readback.
    Long { order: u32 },
}

impl TableCapacity {
    pub fn words(self) -> u32 {
        match self {
            TableCapacity::Short { max_length } => max_length,
            TableCapacity::Long { order } => 1u32 << order,
        }
    }
}

struct Committed {
    data: Vec<u32>,
    length: usize,
    update_index: u64,
}

struct Transient {
    data: Vec<u32>,
    offset: usize,
    binary: bool,
}

/// One table field's state for one instance: the committed `(data,
/// length)` pair behind an rwlock, and the in-progress write behind a
/// try-lock.
pub struct TableBlock {
    block_base: u32,
    instance: u32,
    row_width: usize,
    capacity: TableCapacity,
    committed: RwLock<Committed>,
    writing: Mutex<Option<Transient>>,
    hw: Arc<dyn HardwareBackend>,
    clock: Arc<ChangeClock>,
}

impl TableBlock {
    pub fn new(
        hw: Arc<dyn HardwareBackend>,
        clock: Arc<ChangeClock>,
        block_base: u32,
        instance: u32,
        row_width: usize,
        capacity: TableCapacity,
    ) -> Self {
        TableBlock {
            block_base,
            instance,
            row_width,
            capacity,
            committed: RwLock::new(Committed { data: Vec::new(), length: 0, update_index: 1 }),
            writing: Mutex::new(None),
            hw,
            clock,
        }
    }

    pub fn length(&self) -> usize {
        self.committed.read().length
    }

    pub fn update_index(&self) -> u64 {
        self.committed.read().update_index
    }

    /// The committed words, read back through whichever path spec.md §4.9
    /// names for this table's capacity kind: a long table is "directly
    /// addressable for ... readback (via `hw_read_table_data`)", so its
    /// readback goes through the device rather than this process's own
    /// copy; a short table has no such addressing and reads the in-memory
    /// buffer `close_write` already published.
    fn committed_words(&self) -> Vec<u32> {
        let committed = self.committed.read();
        match self.capacity {
            TableCapacity::Long { .. } => self.hw.read_table_data(self.block_base, self.instance, 0, committed.length as u32),
            TableCapacity::Short { .. } => committed.data[..committed.length].to_vec(),
        }
    }

    /// Rows in committed order, each formatted as space-separated decimal
    /// words (the ASCII multi-line read of spec.md §4.9).
    pub fn read_rows(&self) -> Vec<String> {
        self.committed_words()
            .chunks(self.row_width)
            .map(|row| row.iter().map(u32::to_string).collect::<Vec<_>>().join(" "))
            .collect()
    }

    /// The `B` attribute: whole committed buffer base64-encoded, one line
    /// per row's little-endian byte representation.
    pub fn read_base64_rows(&self) -> Vec<String> {
        self.committed_words()
            .chunks(self.row_width)
            .map(|row| {
                let mut bytes = Vec::with_capacity(row.len() * 4);
                for word in row {
                    bytes.extend_from_slice(&word.to_le_bytes());
                }
                BASE64.encode(bytes)
            })
            .collect()
    }

    /// Starts a write. `append` preserves the currently committed prefix
    /// (new data lands after it); omitting it truncates. Fails immediately,
    /// without blocking, if another writer is already in progress (spec.md
    /// §4.9/§8: "the second fails immediately").
    pub fn open_write(&self, append: bool, binary: bool) -> CommandResult<()> {
        let mut writing = self.writing.lock();
        if writing.is_some() {
            return Err(CommandError::TableBeingWritten);
        }
        let offset = if append { self.committed.read().length } else { 0 };
        *writing = Some(Transient { data: Vec::new(), offset, binary });
        Ok(())
    }

    /// Feeds one payload line (ASCII whitespace-separated `uint32`s, or a
    /// base64-encoded chunk when the writer was opened in binary mode) into
    /// the open writer.
    pub fn write_line(&self, line: &str) -> CommandResult<()> {
        let mut writing = self.writing.lock();
        let transient = writing.as_mut().ok_or_else(|| CommandError::other("no table write in progress"))?;
        if transient.binary {
            let bytes = BASE64.decode(line.trim()).map_err(|e| CommandError::other(format!("invalid base64: {e}")))?;
            if bytes.len() % 4 != 0 {
                return Err(CommandError::other("base64 payload is not a whole number of words"));
            }
            for chunk in bytes.chunks(4) {
                transient.data.push(u32::from_le_bytes(chunk.try_into().unwrap()));
            }
        } else {
            for word in line.split_whitespace() {
                let value: u32 = word.parse().map_err(|_| CommandError::other(format!("invalid table word: '{word}'")))?;
                transient.data.push(value);
            }
        }
        let total = transient.offset + transient.data.len();
        if total > self.capacity.words() as usize {
            // Roll the overflowing write back rather than leave the buffer
            // half-grown (spec.md §8: "the buffer unchanged").
            writing.take();
            return Err(CommandError::other("table write exceeds capacity"));
        }
        Ok(())
    }

    /// Finishes the write: validates row alignment, publishes under the
    /// rwlock, and releases the write-mutex. A bare-newline (zero data
    /// lines) closes as a valid zero-row commit (spec.md §9's resolution of
    /// that cross-revision ambiguity).
    pub fn close_write(&self) -> CommandResult<()> {
        let transient = self.writing.lock().take().ok_or_else(|| CommandError::other("no table write in progress"))?;
        if transient.data.len() % self.row_width != 0 {
            return Err(CommandError::other("table payload is not a whole number of rows"));
        }
        let mut committed = self.committed.write();
        if committed.data.len() < transient.offset + transient.data.len() {
            committed.data.resize(transient.offset + transient.data.len(), 0);
        }
        self.hw.write_table(self.block_base, self.instance, transient.offset as u32, &transient.data);
        self.hw.close_table(self.block_base, self.instance);
        committed.data[transient.offset..transient.offset + transient.data.len()].copy_from_slice(&transient.data);
        committed.length = transient.offset + transient.data.len();
        committed.update_index = self.clock.tick();
        Ok(())
    }

    /// Drops an in-progress write without publishing anything — the path
    /// taken when a client connection closes mid-write (spec.md §5).
    pub fn abort_write(&self) {
        self.writing.lock().take();
    }

    pub fn is_writing(&self) -> bool {
        self.writing.lock().is_some()
    }

    /// Word count accepted so far by the open writer, `offset` included —
    /// how the dispatcher's binary-mode payload knows when `B count` words
    /// have arrived (spec.md §4.9).
    pub fn pending_len(&self) -> Option<usize> {
        self.writing.lock().as_ref().map(|t| t.offset + t.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockHardware;

    fn block(row_width: usize, max_length: u32) -> TableBlock {
        TableBlock::new(
            Arc::new(MockHardware::new()),
            Arc::new(ChangeClock::new()),
            0,
            0,
            row_width,
            TableCapacity::Short { max_length },
        )
    }

    #[test]
    fn spec_example_three() {
        let t = block(1, 8);
        t.open_write(false, false).unwrap();
        t.write_line("1").unwrap();
        t.write_line("2").unwrap();
        t.write_line("3").unwrap();
        t.close_write().unwrap();
        assert_eq!(t.read_rows(), vec!["1", "2", "3"]);
    }

    #[test]
    fn concurrent_writer_fails_immediately() {
        let t = block(1, 8);
        t.open_write(false, false).unwrap();
        assert_eq!(t.open_write(false, false), Err(CommandError::TableBeingWritten));
        t.write_line("9").unwrap();
        t.close_write().unwrap();
        assert_eq!(t.read_rows(), vec!["9"]);
    }

    #[test]
    fn overflow_rejected_and_buffer_unchanged() {
        let t = block(1, 2);
        t.open_write(false, false).unwrap();
        t.write_line("1").unwrap();
        t.write_line("2").unwrap();
        assert!(t.write_line("3").is_err());
        assert!(!t.is_writing());
        assert_eq!(t.length(), 0);
    }

    #[test]
    fn empty_ascii_payload_commits_zero_rows() {
        let t = block(1, 8);
        t.open_write(false, false).unwrap();
        t.close_write().unwrap();
        assert_eq!(t.length(), 0);
        assert!(t.read_rows().is_empty());
    }

    #[test]
    fn misaligned_row_width_rejected() {
        let t = block(2, 8);
        t.open_write(false, false).unwrap();
        t.write_line("1").unwrap();
        assert!(t.close_write().is_err());
    }

    #[test]
    fn append_preserves_prefix() {
        let t = block(1, 8);
        t.open_write(false, false).unwrap();
        t.write_line("1 2").unwrap();
        t.close_write().unwrap();
        t.open_write(true, false).unwrap();
        t.write_line("3").unwrap();
        t.close_write().unwrap();
        assert_eq!(t.read_rows(), vec!["1", "2", "3"]);
    }

    #[test]
    fn base64_round_trip() {
        let t = block(1, 8);
        t.open_write(false, true).unwrap();
        let line = BASE64.encode(7u32.to_le_bytes());
        t.write_line(&line).unwrap();
        t.close_write().unwrap();
        assert_eq!(t.read_rows(), vec!["7"]);
    }
}
