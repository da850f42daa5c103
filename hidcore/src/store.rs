//! Implements the shared buffer holding the values of all data elements.
//!
//! Every data element owns one record of the store:
//!
//! | word  | content                                             |
//! |-------|-----------------------------------------------------|
//! | 0     | cookie of the element                               |
//! | 1     | size of the record in bytes                         |
//! | 2, 3  | timestamp of the last update in nanoseconds (LE)    |
//! | 4..   | value as little-endian 32-bit words                 |
//!
//! The store is only written while the element lock is held, but it can be
//! read through a [`ValueStoreHandle`] at any time without locking. Readers
//! may observe a record in the middle of an update.

use std::{
    collections::TryReserveError,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use crate::{bits, element::Cookie};

/// The size of a record header in bytes.
pub const RECORD_HEADER_BYTES: usize = 16;

const HEADER_WORDS: usize = RECORD_HEADER_BYTES / 4;

/// The location of an element's record inside the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ValueSlot {
    /// The offset of the record in bytes.
    pub offset: usize,

    /// The size of the record in bytes.
    pub size: usize,
}

impl ValueSlot {
    fn words(&self) -> std::ops::Range<usize> {
        self.offset / 4..(self.offset + self.size) / 4
    }
}

/// A snapshot of a single record.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ElementValue {
    /// The element the record belongs to.
    pub cookie: Cookie,

    /// The timestamp of the last update, in nanoseconds since the creation of
    /// the owning device.
    pub timestamp: u64,

    /// The raw value words.
    pub value: Vec<u32>,
}

/// The writable value store, owned by the element tree.
#[derive(Debug)]
pub struct ValueStore {
    words: Arc<[AtomicU32]>,
}

impl ValueStore {
    /// Returns the size of the record of an element with the given bit width.
    pub fn record_size(bit_width: u32) -> usize {
        RECORD_HEADER_BYTES + bits::words_for(bit_width) * 4
    }

    /// Allocates a zeroed store of `capacity` bytes.
    pub(crate) fn allocate(capacity: usize) -> Result<Self, TryReserveError> {
        let len = capacity.div_ceil(4);
        let mut words = Vec::new();
        words.try_reserve_exact(len)?;
        words.extend((0..len).map(|_| AtomicU32::new(0)));

        Ok(Self {
            words: Arc::from(words),
        })
    }

    /// Writes the header of a record.
    pub(crate) fn init_record(&self, slot: ValueSlot, cookie: Cookie) {
        let words = &self.words[slot.words()];
        words[0].store(cookie.0, Ordering::Relaxed);
        words[1].store(slot.size as u32, Ordering::Relaxed);
    }

    /// Updates the timestamp and value of a record.
    pub(crate) fn write(&self, slot: ValueSlot, timestamp: u64, value: &[u32]) {
        let words = &self.words[slot.words()];
        words[2].store(timestamp as u32, Ordering::Relaxed);
        words[3].store((timestamp >> 32) as u32, Ordering::Relaxed);

        for (dst, src) in words[HEADER_WORDS..].iter().zip(value) {
            dst.store(*src, Ordering::Release);
        }
    }

    /// Creates a read-only handle to the store.
    pub fn handle(&self) -> ValueStoreHandle {
        ValueStoreHandle {
            words: Arc::clone(&self.words),
        }
    }
}

/// A cheaply clonable, read-only reference to a value store.
#[derive(Clone, Debug)]
pub struct ValueStoreHandle {
    words: Arc<[AtomicU32]>,
}

impl ValueStoreHandle {
    /// The size of the store in bytes.
    pub fn len(&self) -> usize {
        self.words.len() * 4
    }

    /// Checks whether the store holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Reads the record at `slot`.
    ///
    /// Returns [`None`] if the slot lies outside the store or is too small to
    /// hold a record.
    pub fn read_element(&self, slot: ValueSlot) -> Option<ElementValue> {
        if slot.size < RECORD_HEADER_BYTES || slot.offset % 4 != 0 || slot.size % 4 != 0 {
            return None;
        }

        let words = self.words.get(slot.words())?;
        let lo = words[2].load(Ordering::Relaxed) as u64;
        let hi = words[3].load(Ordering::Relaxed) as u64;

        Some(ElementValue {
            cookie: Cookie(words[0].load(Ordering::Relaxed)),
            timestamp: (hi << 32) | lo,
            value: words[HEADER_WORDS..]
                .iter()
                .map(|word| word.load(Ordering::Acquire))
                .collect(),
        })
    }

    /// Copies the whole store into a byte vector, in the layout an external
    /// mapping would see.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words
            .iter()
            .flat_map(|word| word.load(Ordering::Acquire).to_le_bytes())
            .collect()
    }
}
