//! Describes the capability tables an element tree is built from.
//!
//! A report descriptor is not consumed directly. Instead, a pre-parser turns it
//! into flat tables of collection nodes, button capabilities and value
//! capabilities, which are exposed through the [`CapabilitySource`] trait.
//! [`CapabilityTable`] is an in-memory implementation of that trait which can
//! be filled by hand, deserialized, or produced from raw descriptor bytes via
//! [`CapabilityTable::from_descriptor`].

use std::{convert::Infallible, error::Error};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Represents the three kinds of reports a HID device exchanges.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ReportType {
    /// Reports sent from the device to the host.
    Input = 0,

    /// Reports sent from the host to the device.
    Output = 1,

    /// Configuration reports that can be read and written by the host.
    Feature = 2,
}

impl ReportType {
    /// All report types, in the order elements and tables are laid out.
    pub const ALL: [ReportType; 3] = [ReportType::Input, ReportType::Output, ReportType::Feature];

    /// The number of report types.
    pub const COUNT: usize = 3;

    /// The position of the report type inside per-type tables.
    pub fn index(self) -> usize {
        u8::from(self) as usize
    }
}

/// Summarizes the contents of a [`CapabilitySource`].
///
/// All per-type arrays are indexed by [`ReportType::index`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities {
    /// The number of collection nodes, including the root collection at index
    /// 0.
    pub collection_count: u32,

    /// The number of button capabilities per report type.
    pub button_counts: [u32; ReportType::COUNT],

    /// The number of value capabilities per report type.
    pub value_counts: [u32; ReportType::COUNT],

    /// The length in bytes of the longest report per report type, including
    /// the report ID prefix if there is one.
    pub max_report_bytes: [u32; ReportType::COUNT],
}

/// A single collection node.
///
/// The node at index 0 is the root collection and its parent is ignored.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CollectionNode {
    /// The index of the parent collection node. Must be smaller than the
    /// index of the node itself.
    pub parent: u32,

    /// The collection type code (physical, application, logical, ...).
    #[cfg_attr(feature = "serde", serde(default))]
    pub collection_type: u8,

    /// The usage page of the collection.
    #[cfg_attr(feature = "serde", serde(default))]
    pub usage_page: u16,

    /// The usage of the collection.
    #[cfg_attr(feature = "serde", serde(default))]
    pub usage: u16,
}

/// A single button: a one bit field in a report.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ButtonCap {
    /// The index of the collection node the button belongs to.
    pub parent: u32,

    /// The ID of the report the button is part of.
    pub report_id: u8,

    /// The offset of the button bit from the start of the report, in bits.
    pub bit_offset: u32,

    /// The usage page of the button.
    #[cfg_attr(feature = "serde", serde(default))]
    pub usage_page: u16,

    /// The usage of the button.
    #[cfg_attr(feature = "serde", serde(default))]
    pub usage: u16,
}

/// A single value: a multi bit field in a report.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueCap {
    /// The index of the collection node the value belongs to.
    pub parent: u32,

    /// The ID of the report the value is part of.
    pub report_id: u8,

    /// The offset of the first value bit from the start of the report, in
    /// bits.
    pub bit_offset: u32,

    /// The width of the value, in bits.
    pub bit_width: u32,

    /// Whether the value is a two's complement signed number.
    #[cfg_attr(feature = "serde", serde(default))]
    pub signed: bool,

    /// The smallest value the device reports.
    #[cfg_attr(feature = "serde", serde(default))]
    pub logical_min: i32,

    /// The largest value the device reports.
    #[cfg_attr(feature = "serde", serde(default))]
    pub logical_max: i32,

    /// The usage page of the value.
    #[cfg_attr(feature = "serde", serde(default))]
    pub usage_page: u16,

    /// The usage of the value.
    #[cfg_attr(feature = "serde", serde(default))]
    pub usage: u16,
}

/// The sizes of the reports sharing one report ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReportBits {
    /// The report ID.
    pub report_id: u8,

    /// The length of the report per report type, in bits. Zero means the
    /// report does not exist for that type.
    pub bits: [u32; ReportType::COUNT],
}

/// Provides the flattened capability tables of a parsed report descriptor.
///
/// Implementations must list collection nodes parent-before-child, with the
/// root collection at index 0.
pub trait CapabilitySource {
    /// An implementation-specific error type.
    type Error: Error + Send + Sync + 'static;

    /// Returns the counts of all capability records.
    fn capabilities(&self) -> Result<Capabilities, Self::Error>;

    /// Returns all collection nodes in descriptor order.
    fn collection_nodes(&self) -> Result<Vec<CollectionNode>, Self::Error>;

    /// Returns all button capabilities of a report type in descriptor order.
    fn button_caps(&self, report_type: ReportType) -> Result<Vec<ButtonCap>, Self::Error>;

    /// Returns all value capabilities of a report type in descriptor order.
    fn value_caps(&self, report_type: ReportType) -> Result<Vec<ValueCap>, Self::Error>;

    /// Returns the bit lengths of all declared reports.
    ///
    /// An empty list means the sizes are unknown.
    fn reports(&self) -> Result<Vec<ReportBits>, Self::Error> {
        Ok(Vec::new())
    }
}

/// An in-memory [`CapabilitySource`].
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapabilityTable {
    /// All collection nodes, starting with the root collection.
    pub collections: Vec<CollectionNode>,

    /// All button capabilities, per report type.
    pub buttons: [Vec<ButtonCap>; ReportType::COUNT],

    /// All value capabilities, per report type.
    pub values: [Vec<ValueCap>; ReportType::COUNT],

    /// The sizes of all declared reports.
    #[cfg_attr(feature = "serde", serde(default))]
    pub reports: Vec<ReportBits>,

    /// The length in bytes of the longest report per report type.
    #[cfg_attr(feature = "serde", serde(default))]
    pub max_report_bytes: [u32; ReportType::COUNT],
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityTable {
    /// Creates a table containing nothing but the root collection.
    pub fn new() -> Self {
        Self {
            collections: vec![CollectionNode::default()],
            buttons: Default::default(),
            values: Default::default(),
            reports: Vec::new(),
            max_report_bytes: [0; ReportType::COUNT],
        }
    }

    /// Appends a collection node and returns its index.
    pub fn add_collection(&mut self, node: CollectionNode) -> u32 {
        self.collections.push(node);
        (self.collections.len() - 1) as u32
    }

    /// Appends a button capability to the list of its report type.
    pub fn add_button(&mut self, report_type: ReportType, cap: ButtonCap) {
        self.buttons[report_type.index()].push(cap);
    }

    /// Appends a value capability to the list of its report type.
    pub fn add_value(&mut self, report_type: ReportType, cap: ValueCap) {
        self.values[report_type.index()].push(cap);
    }

    /// Declares the bit length of a report. Lengths of an already declared
    /// report ID are merged, keeping the larger one per type.
    pub fn add_report_bits(&mut self, report_id: u8, report_type: ReportType, bits: u32) {
        let bytes = bits.div_ceil(8);
        let max = &mut self.max_report_bytes[report_type.index()];
        *max = (*max).max(bytes);

        if let Some(existing) = self.reports.iter_mut().find(|r| r.report_id == report_id) {
            let slot = &mut existing.bits[report_type.index()];
            *slot = (*slot).max(bits);
            return;
        }

        let mut report = ReportBits {
            report_id,
            bits: [0; ReportType::COUNT],
        };
        report.bits[report_type.index()] = bits;
        self.reports.push(report);
    }
}

impl CapabilitySource for CapabilityTable {
    type Error = Infallible;

    fn capabilities(&self) -> Result<Capabilities, Self::Error> {
        Ok(Capabilities {
            collection_count: self.collections.len() as u32,
            button_counts: self.buttons.each_ref().map(|caps| caps.len() as u32),
            value_counts: self.values.each_ref().map(|caps| caps.len() as u32),
            max_report_bytes: self.max_report_bytes,
        })
    }

    fn collection_nodes(&self) -> Result<Vec<CollectionNode>, Self::Error> {
        Ok(self.collections.clone())
    }

    fn button_caps(&self, report_type: ReportType) -> Result<Vec<ButtonCap>, Self::Error> {
        Ok(self.buttons[report_type.index()].clone())
    }

    fn value_caps(&self, report_type: ReportType) -> Result<Vec<ValueCap>, Self::Error> {
        Ok(self.values[report_type.index()].clone())
    }

    fn reports(&self) -> Result<Vec<ReportBits>, Self::Error> {
        Ok(self.reports.clone())
    }
}
