//! Implements the table mapping arriving reports to the elements they carry.

use crate::{caps::ReportType, element::Cookie};

/// The number of report handler slots. Report IDs are mapped to a slot by
/// their lowest bits, so IDs that differ by a multiple of this number share a
/// slot.
pub const REPORT_HANDLER_SLOTS: usize = 8;

/// Returns the slot a report ID is dispatched to.
pub fn slot_for(report_id: u8) -> usize {
    report_id as usize & (REPORT_HANDLER_SLOTS - 1)
}

/// Holds one chain of data elements per slot and report type.
///
/// Chains only hold cookies, the elements themselves are owned by the element
/// tree. Elements are prepended on registration, so the newest registration
/// comes first.
#[derive(Clone, Debug, Default)]
pub struct DispatchTable {
    chains: [[Vec<Cookie>; ReportType::COUNT]; REPORT_HANDLER_SLOTS],
}

impl DispatchTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a data element at the head of the chain for its report ID and
    /// type. Returns the cookie the element is referenced by.
    pub fn register(&mut self, cookie: Cookie, report_type: ReportType, report_id: u8) -> Cookie {
        self.chains[slot_for(report_id)][report_type.index()].insert(0, cookie);
        cookie
    }

    /// Returns the chain of a slot. The chain is empty if no element was
    /// registered, or if `slot` is out of range.
    pub fn lookup(&self, slot: usize, report_type: ReportType) -> &[Cookie] {
        self.chains
            .get(slot)
            .map_or(&[], |types| types[report_type.index()].as_slice())
    }

    /// Returns the chain a report with the given ID is dispatched to.
    ///
    /// The chain may contain elements of other report IDs sharing the slot.
    pub fn chain_for(&self, report_id: u8, report_type: ReportType) -> &[Cookie] {
        self.lookup(slot_for(report_id), report_type)
    }

    /// Iterates over all registered cookies, slot by slot, then type by type,
    /// then in chain order.
    pub fn iter(&self) -> impl Iterator<Item = Cookie> + '_ {
        self.chains
            .iter()
            .flat_map(|types| types.iter())
            .flat_map(|chain| chain.iter().copied())
    }

    /// The total number of registered elements.
    pub fn len(&self) -> usize {
        self.chains
            .iter()
            .flat_map(|types| types.iter())
            .map(Vec::len)
            .sum()
    }

    /// Checks whether no element was registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
