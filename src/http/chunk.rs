//! Reassembly of segmented response bodies.
//!
//! A body larger than the segment threshold arrives as a head chunk followed
//! by segments that are each fetched individually. [`ChunkSequence`] holds
//! them in order until the connection writes them out.
//!
//! ```text
//!   slots:  [ head ][ seg1 ][  --  ][  --  ]
//!                     ▲        ▲
//!                   read     write
//! ```

use thiserror::Error;

use crate::store::Chunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// Every declared segment has already been handed out.
    #[error("no more chunks")]
    Exhausted,

    /// A segment arrived after the declared count was reached.
    #[error("chunk sequence overflow: {expected} segments declared")]
    Overflow { expected: usize },

    /// The slot at the write cursor is already occupied.
    #[error("chunk slot {slot} already filled")]
    SlotFilled { slot: usize },
}

/// Ordered, lazily filled array of body segments.
///
/// Invariant: `write >= read`.
#[derive(Debug)]
pub struct ChunkSequence {
    slots: Vec<Option<Chunk>>,
    read: usize,
    write: usize,
}

impl ChunkSequence {
    /// Sizes the sequence from the head's declared total length and stores
    /// the head in the first slot.
    pub fn new(head: Chunk, threshold: usize) -> Self {
        let threshold = threshold.max(1) as u64;
        let count = head.total_len.div_ceil(threshold).max(1) as usize;

        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || None);
        slots[0] = Some(head);

        Self {
            slots,
            read: 0,
            write: 1,
        }
    }

    /// Total number of segments, head included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stores the next segment at the write cursor.
    pub fn set_chunk(&mut self, chunk: Chunk) -> Result<(), ChunkError> {
        if self.write >= self.slots.len() {
            return Err(ChunkError::Overflow {
                expected: self.slots.len(),
            });
        }
        if self.slots[self.write].is_some() {
            return Err(ChunkError::SlotFilled { slot: self.write });
        }

        self.slots[self.write] = Some(chunk);
        self.write += 1;
        Ok(())
    }

    /// Takes the segment at the read cursor.
    ///
    /// `Ok(None)` means it has not arrived yet; `Err(Exhausted)` means every
    /// segment has been taken.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        if self.read >= self.slots.len() {
            return Err(ChunkError::Exhausted);
        }

        match self.slots[self.read].take() {
            Some(chunk) => {
                self.read += 1;
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// True while nothing has been read, i.e. the head is still pending.
    pub fn is_chunk_head(&self) -> bool {
        self.read == 0
    }

    /// Whether the segment at the read cursor is ready to be taken.
    pub fn has_ready(&self) -> bool {
        self.slots.get(self.read).is_some_and(Option::is_some)
    }

    /// Every segment has been taken.
    pub fn is_exhausted(&self) -> bool {
        self.read >= self.slots.len()
    }
}
