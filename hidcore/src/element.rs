//! Implements the nodes of an element tree.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    bits,
    caps::{ButtonCap, CollectionNode, ReportType, ValueCap},
    store::{ValueSlot, ValueStore},
};

/// An opaque, stable reference to an element: its index in the element table.
///
/// The cookie `0` always refers to the root collection. Subscription calls
/// additionally interpret it as "every data element".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Cookie(pub u32);

impl Cookie {
    /// The cookie of the root collection.
    pub const ROOT: Cookie = Cookie(0);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for Cookie {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Cookie> for u32 {
    fn from(value: Cookie) -> Self {
        value.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Represents what an element describes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ElementKind {
    /// A group of other elements.
    Collection = 0,

    /// A one bit control.
    Button = 1,

    /// A multi bit control, such as an axis.
    Value = 2,
}

/// The transaction state of a data element.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum TransactionState {
    /// The element is not part of a running transaction.
    #[default]
    Idle,

    /// The element is part of a running transaction that has not serviced it
    /// yet.
    Pending,
}

/// The location of a data element inside a report.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ReportField {
    /// The type of report the element is part of.
    pub report_type: ReportType,

    /// The ID of the report the element is part of.
    pub report_id: u8,

    /// The offset of the first bit from the start of the report buffer,
    /// including the report ID prefix if there is one.
    pub bit_offset: u32,

    /// The width of the field, in bits.
    pub bit_width: u32,
}

impl ReportField {
    /// The offset of the first bit after the field.
    pub fn end_bit(&self) -> u32 {
        self.bit_offset.saturating_add(self.bit_width)
    }
}

/// The range of a value element.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ValueRange {
    /// Whether the value is a two's complement signed number.
    pub signed: bool,

    /// The smallest value the device reports.
    pub logical_min: i32,

    /// The largest value the device reports.
    pub logical_max: i32,
}

/// A single node of the element tree.
#[derive(Clone, Debug)]
pub struct Element {
    cookie: Cookie,
    kind: ElementKind,
    parent: Option<Cookie>,
    children: Vec<Cookie>,
    collection_type: u8,
    usage_page: u16,
    usage: u16,
    field: Option<ReportField>,
    range: Option<ValueRange>,

    /// The cached value words. Empty for collections.
    value: Vec<u32>,

    /// The timestamp of the last value update.
    timestamp: u64,

    /// The record of the element inside the value store.
    slot: Option<ValueSlot>,

    transaction: TransactionState,
}

impl Element {
    pub(crate) fn collection(cookie: Cookie, node: &CollectionNode) -> Self {
        Self {
            cookie,
            kind: ElementKind::Collection,
            parent: None,
            children: Vec::new(),
            collection_type: node.collection_type,
            usage_page: node.usage_page,
            usage: node.usage,
            field: None,
            range: None,
            value: Vec::new(),
            timestamp: 0,
            slot: None,
            transaction: TransactionState::Idle,
        }
    }

    pub(crate) fn button(cookie: Cookie, report_type: ReportType, cap: &ButtonCap) -> Self {
        Self {
            cookie,
            kind: ElementKind::Button,
            parent: Some(Cookie(cap.parent)),
            children: Vec::new(),
            collection_type: 0,
            usage_page: cap.usage_page,
            usage: cap.usage,
            field: Some(ReportField {
                report_type,
                report_id: cap.report_id,
                bit_offset: cap.bit_offset,
                bit_width: 1,
            }),
            range: Some(ValueRange {
                signed: false,
                logical_min: 0,
                logical_max: 1,
            }),
            value: vec![0],
            timestamp: 0,
            slot: None,
            transaction: TransactionState::Idle,
        }
    }

    pub(crate) fn value(cookie: Cookie, report_type: ReportType, cap: &ValueCap) -> Self {
        Self {
            cookie,
            kind: ElementKind::Value,
            parent: Some(Cookie(cap.parent)),
            children: Vec::new(),
            collection_type: 0,
            usage_page: cap.usage_page,
            usage: cap.usage,
            field: Some(ReportField {
                report_type,
                report_id: cap.report_id,
                bit_offset: cap.bit_offset,
                bit_width: cap.bit_width,
            }),
            range: Some(ValueRange {
                signed: cap.signed,
                logical_min: cap.logical_min,
                logical_max: cap.logical_max,
            }),
            value: vec![0; bits::words_for(cap.bit_width)],
            timestamp: 0,
            slot: None,
            transaction: TransactionState::Idle,
        }
    }

    /// The cookie identifying the element.
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// What the element describes.
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Whether the element is a button or a value.
    pub fn is_data(&self) -> bool {
        self.field.is_some()
    }

    /// The parent collection. [`None`] only for the root collection.
    pub fn parent(&self) -> Option<Cookie> {
        self.parent
    }

    /// The children of a collection, in element table order.
    pub fn children(&self) -> &[Cookie] {
        &self.children
    }

    /// The collection type code. Zero for data elements.
    pub fn collection_type(&self) -> u8 {
        self.collection_type
    }

    /// The usage page of the element.
    pub fn usage_page(&self) -> u16 {
        self.usage_page
    }

    /// The usage of the element.
    pub fn usage(&self) -> u16 {
        self.usage
    }

    /// Where the element lives inside its report. [`None`] for collections.
    pub fn field(&self) -> Option<ReportField> {
        self.field
    }

    /// The logical range of a data element.
    pub fn range(&self) -> Option<ValueRange> {
        self.range
    }

    /// The record of the element in the value store.
    pub fn slot(&self) -> Option<ValueSlot> {
        self.slot
    }

    /// The current transaction state.
    pub fn transaction_state(&self) -> TransactionState {
        self.transaction
    }

    /// The cached raw value words.
    pub fn raw_value(&self) -> &[u32] {
        &self.value
    }

    /// The timestamp of the last value update, in nanoseconds since the
    /// creation of the owning device.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The cached value interpreted as a logical number, sign extended if the
    /// element is signed. Values wider than 32 bits are truncated.
    pub fn logical_value(&self) -> i64 {
        let raw = self.value.first().copied().unwrap_or(0);
        match (self.field, self.range) {
            (Some(field), Some(range)) if range.signed => {
                bits::sign_extend(raw, field.bit_width.min(32)) as i64
            },
            _ => raw as i64,
        }
    }

    /// The size of the element's value store record in bytes. Zero for
    /// collections.
    pub fn value_size(&self) -> usize {
        match self.field {
            Some(field) => ValueStore::record_size(field.bit_width),
            None => 0,
        }
    }

    pub(crate) fn set_parent(&mut self, parent: Cookie) {
        self.parent = Some(parent);
    }

    pub(crate) fn add_child(&mut self, child: Cookie) {
        self.children.push(child);
    }

    pub(crate) fn set_slot(&mut self, slot: ValueSlot) {
        self.slot = Some(slot);
    }

    pub(crate) fn set_transaction_state(&mut self, state: TransactionState) {
        if self.is_data() {
            self.transaction = state;
        }
    }

    /// Takes the element's bits out of an arriving report.
    ///
    /// Elements of other reports sharing the dispatch slot, and reports too
    /// short to contain the element, are skipped. Returns whether the cached
    /// value changed.
    pub(crate) fn consume_report(
        &mut self,
        report_id: u8,
        report: &[u8],
        timestamp: u64,
        store: &ValueStore,
    ) -> bool {
        let Some(field) = self.field else {
            return false;
        };
        if field.report_id != report_id {
            return false;
        }

        let mut fresh = vec![0u32; self.value.len()];
        if !bits::read(report, field.bit_offset, field.bit_width, &mut fresh) {
            return false;
        }

        let changed = fresh != self.value;
        self.value = fresh;
        self.timestamp = timestamp;
        self.transaction = TransactionState::Idle;

        if let Some(slot) = self.slot {
            store.write(slot, timestamp, &self.value);
        }

        changed
    }

    /// Writes the element's current value into a report being assembled.
    ///
    /// Returns `false` if the element belongs to another report or does not
    /// fit the buffer.
    pub(crate) fn serialize_into(&mut self, report_id: u8, report: &mut [u8]) -> bool {
        let Some(field) = self.field else {
            return false;
        };
        if field.report_id != report_id {
            return false;
        }

        let written = bits::write(report, field.bit_offset, field.bit_width, &self.value);
        self.transaction = TransactionState::Idle;
        written
    }

    /// Replaces the cached value with a logical number, truncated to the
    /// element's width.
    pub(crate) fn stage(&mut self, value: i64, timestamp: u64, store: &ValueStore) -> bool {
        let Some(field) = self.field else {
            return false;
        };

        let mut words = bits::from_logical(value, field.bit_width);
        words.resize(self.value.len(), 0);
        self.value = words;
        self.timestamp = timestamp;

        if let Some(slot) = self.slot {
            store.write(slot, timestamp, &self.value);
        }

        true
    }
}
