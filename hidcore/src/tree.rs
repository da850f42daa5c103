//! Builds the element tree out of a [`CapabilitySource`].

use std::{
    collections::{BTreeSet, HashMap, TryReserveError},
    error::Error,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    caps::{CapabilitySource, ReportType},
    dispatch::DispatchTable,
    element::{Cookie, Element, ReportField, TransactionState},
    store::{ValueSlot, ValueStore, ValueStoreHandle},
};

/// Represents an error that occurred while building an element tree.
///
/// Nothing built before the error is retained.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Memory for the element table or the value store could not be
    /// allocated.
    #[error("could not allocate memory for the element tree")]
    OutOfMemory,

    /// The capability records are inconsistent.
    #[error("the report descriptor is malformed: {0}")]
    MalformedDescriptor(String),

    /// The capability source itself failed.
    #[error("the capability source failed")]
    Source(#[source] Box<dyn Error + Send + Sync>),
}

impl BuildError {
    fn from_source<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Source(Box::new(err))
    }
}

/// The flat element table of a device, together with its dispatch table and
/// value store.
///
/// The structure of the tree never changes after it was built, only the
/// values of its elements do.
#[derive(Debug)]
pub struct ElementTree {
    elements: Vec<Element>,
    first_data: usize,
    dispatch: DispatchTable,
    store: ValueStore,

    /// The declared bit length per report ID and type.
    report_bits: HashMap<(u8, ReportType), u32>,

    /// The number of distinct report IDs of the device.
    report_count: usize,

    /// The ID of every report if the device declares exactly one.
    implicit_report_id: u8,

    /// The length of the longest report of any type, in bytes.
    max_report_bytes: usize,
}

impl ElementTree {
    /// Builds the element tree described by a capability source.
    ///
    /// The root collection is placed at index 0, followed by all other
    /// collections. All buttons (input, output, feature) come next, then all
    /// values in the same type order.
    pub fn build<S: CapabilitySource + ?Sized>(source: &S) -> Result<Self, BuildError> {
        let caps = source.capabilities().map_err(BuildError::from_source)?;

        let collection_count = caps.collection_count as usize;
        if collection_count == 0 {
            return Err(BuildError::MalformedDescriptor(
                "no root collection".to_string(),
            ));
        }

        let total = caps
            .button_counts
            .iter()
            .chain(caps.value_counts.iter())
            .fold(collection_count, |acc, count| acc.saturating_add(*count as usize));

        let mut elements: Vec<Element> = Vec::new();
        elements
            .try_reserve_exact(total)
            .map_err(|_| BuildError::OutOfMemory)?;

        let nodes = source.collection_nodes().map_err(BuildError::from_source)?;
        if nodes.len() != collection_count {
            return Err(BuildError::MalformedDescriptor(format!(
                "expected {collection_count} collections, got {}",
                nodes.len()
            )));
        }

        for (index, node) in nodes.iter().enumerate() {
            let mut element = Element::collection(Cookie(index as u32), node);
            if index > 0 {
                let parent = node.parent as usize;
                if parent >= index {
                    return Err(BuildError::MalformedDescriptor(format!(
                        "collection {index} has parent {parent}"
                    )));
                }
                element.set_parent(Cookie(node.parent));
                elements[parent].add_child(Cookie(index as u32));
            }
            elements.push(element);
        }

        let first_data = elements.len();
        let mut dispatch = DispatchTable::new();

        for report_type in ReportType::ALL {
            let buttons = source.button_caps(report_type).map_err(BuildError::from_source)?;
            check_count("button", report_type, caps.button_counts, buttons.len())?;

            for cap in &buttons {
                check_field_end(report_type, cap.bit_offset, 1)?;
                let cookie = Cookie(elements.len() as u32);
                let element = Element::button(cookie, report_type, cap);
                attach(&mut elements, &mut dispatch, first_data, cap.parent, element)?;
            }
        }

        for report_type in ReportType::ALL {
            let values = source.value_caps(report_type).map_err(BuildError::from_source)?;
            check_count("value", report_type, caps.value_counts, values.len())?;

            for cap in &values {
                if cap.bit_width == 0 {
                    return Err(BuildError::MalformedDescriptor(format!(
                        "{report_type:?} value at bit {} has no width",
                        cap.bit_offset
                    )));
                }
                check_field_end(report_type, cap.bit_offset, cap.bit_width)?;

                let cookie = Cookie(elements.len() as u32);
                let element = Element::value(cookie, report_type, cap);
                attach(&mut elements, &mut dispatch, first_data, cap.parent, element)?;
            }
        }

        // Records are laid out in dispatch order.
        let mut capacity = 0usize;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(dispatch.len())
            .map_err(|_| BuildError::OutOfMemory)?;
        for cookie in dispatch.iter() {
            let size = elements[cookie.index()].value_size();
            slots.push((cookie, ValueSlot { offset: capacity, size }));
            capacity += size;
        }

        let store = ValueStore::allocate(capacity).map_err(|_| BuildError::OutOfMemory)?;
        for (cookie, slot) in slots {
            store.init_record(slot, cookie);
            elements[cookie.index()].set_slot(slot);
        }

        let reports = source.reports().map_err(BuildError::from_source)?;
        let mut report_bits = HashMap::new();
        for report in &reports {
            for report_type in ReportType::ALL {
                let bits = report.bits[report_type.index()];
                if bits > 0 {
                    report_bits.insert((report.report_id, report_type), bits);
                }
            }
        }

        let report_ids: BTreeSet<u8> = if reports.is_empty() {
            elements[first_data..]
                .iter()
                .filter_map(|element| element.field().map(|field| field.report_id))
                .collect()
        } else {
            reports.iter().map(|report| report.report_id).collect()
        };

        let furthest_byte = elements[first_data..]
            .iter()
            .filter_map(Element::field)
            .map(|field| field.end_bit().div_ceil(8) as usize)
            .max()
            .unwrap_or(0);
        let declared_bytes = report_bits
            .values()
            .map(|bits| bits.div_ceil(8))
            .chain(caps.max_report_bytes)
            .max()
            .unwrap_or(0) as usize;

        let implicit_report_id = match (report_ids.len(), report_ids.first()) {
            (1, Some(id)) => *id,
            _ => 0,
        };

        let tree = Self {
            first_data,
            dispatch,
            store,
            report_bits,
            report_count: report_ids.len(),
            implicit_report_id,
            max_report_bytes: declared_bytes.max(furthest_byte),
            elements,
        };

        debug!(
            collections = first_data,
            buttons = ?caps.button_counts,
            values = ?caps.value_counts,
            reports = tree.report_count,
            max_report_bytes = tree.max_report_bytes,
            value_store_bytes = capacity,
            "built element tree"
        );

        Ok(tree)
    }

    /// Returns the element referenced by a cookie.
    pub fn element(&self, cookie: Cookie) -> Option<&Element> {
        self.elements.get(cookie.index())
    }

    pub(crate) fn element_mut(&mut self, cookie: Cookie) -> Option<&mut Element> {
        self.elements.get_mut(cookie.index())
    }

    /// Returns the data element referenced by a cookie. Collections and
    /// unknown cookies yield [`None`].
    pub fn data_element(&self, cookie: Cookie) -> Option<&Element> {
        self.element(cookie).filter(|element| element.is_data())
    }

    /// Returns all elements in cookie order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Returns the synthetic root collection.
    pub fn root(&self) -> &Element {
        &self.elements[0]
    }

    /// The total number of elements, including all collections.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Checks whether the tree holds no elements. A built tree always holds
    /// at least its root.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The cookie of the first data element. All smaller cookies refer to
    /// collections.
    pub fn first_data_cookie(&self) -> Cookie {
        Cookie(self.first_data as u32)
    }

    /// Iterates over all buttons and values.
    pub fn data_elements(&self) -> impl Iterator<Item = &Element> + '_ {
        self.elements[self.first_data..].iter()
    }

    /// Checks whether a cookie refers to a data element.
    pub fn is_data(&self, cookie: Cookie) -> bool {
        self.data_element(cookie).is_some()
    }

    /// Returns the report dispatch table.
    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    /// Creates a read-only handle to the value store.
    pub fn value_store_handle(&self) -> ValueStoreHandle {
        self.store.handle()
    }

    /// The number of distinct report IDs of the device.
    pub fn report_count(&self) -> usize {
        self.report_count
    }

    /// Whether reports carry their report ID in the first byte.
    pub fn uses_report_ids(&self) -> bool {
        self.report_count > 1
    }

    /// The declared length of a report in bits, if known.
    pub fn report_bits(&self, report_id: u8, report_type: ReportType) -> Option<u32> {
        self.report_bits.get(&(report_id, report_type)).copied()
    }

    /// The length of the longest report of any type, in bytes.
    pub fn max_report_bytes(&self) -> usize {
        self.max_report_bytes
    }

    /// Returns the report ID of an arriving report buffer.
    ///
    /// Devices with several report IDs carry the ID in the first byte. A
    /// device declaring a single report ID implies that ID for every report.
    pub fn report_id_of(&self, report: &[u8]) -> u8 {
        match report.first() {
            Some(id) if self.uses_report_ids() => *id,
            _ => self.implicit_report_id,
        }
    }

    /// Feeds a report to every element of its dispatch chain, calling
    /// `on_change` for every element whose value changed.
    pub(crate) fn consume(
        &mut self,
        report_type: ReportType,
        report: &[u8],
        timestamp: u64,
        mut on_change: impl FnMut(&Element),
    ) -> bool {
        let report_id = self.report_id_of(report);
        let mut changed = false;

        for cookie in self.dispatch.chain_for(report_id, report_type) {
            let Some(element) = self.elements.get_mut(cookie.index()) else {
                continue;
            };

            if element.consume_report(report_id, report, timestamp, &self.store) {
                on_change(element);
                changed = true;
            }
        }

        changed
    }

    /// Writes the current values of all elements of a report into a freshly
    /// allocated report buffer.
    ///
    /// The buffer is sized by the declared report length if there is one, and
    /// by the furthest bit of the report's elements otherwise. It starts with
    /// the report ID if the device uses report IDs, or if the report has a
    /// non-zero ID and none of its elements occupy the first byte. Every
    /// serialized element returns to [`TransactionState::Idle`].
    pub(crate) fn serialize_report(
        &mut self,
        report_type: ReportType,
        report_id: u8,
    ) -> Result<Vec<u8>, TryReserveError> {
        let declared = self
            .report_bits(report_id, report_type)
            .map(|bits| bits.div_ceil(8) as usize);

        let chain = self.dispatch.chain_for(report_id, report_type);
        let elements = &self.elements;
        let fields = move || {
            chain
                .iter()
                .filter_map(move |cookie| elements.get(cookie.index()))
                .filter_map(Element::field)
                .filter(move |field| field.report_id == report_id)
        };

        let prefixed = self.uses_report_ids()
            || (report_id != 0 && fields().all(|field| field.bit_offset >= 8));
        let len = declared
            .unwrap_or_else(|| {
                fields()
                    .map(|field| field.end_bit().div_ceil(8) as usize)
                    .max()
                    .unwrap_or(0)
            })
            .max(usize::from(prefixed));

        let mut report = Vec::new();
        report.try_reserve_exact(len)?;
        report.resize(len, 0);
        if prefixed {
            report[0] = report_id;
        }

        for cookie in chain {
            if let Some(element) = self.elements.get_mut(cookie.index()) {
                element.serialize_into(report_id, &mut report);
            }
        }

        Ok(report)
    }

    /// Stages a logical value on a data element. Returns `false` for
    /// collections and unknown cookies.
    pub(crate) fn stage(&mut self, cookie: Cookie, value: i64, timestamp: u64) -> bool {
        match self.elements.get_mut(cookie.index()) {
            Some(element) => element.stage(value, timestamp, &self.store),
            None => false,
        }
    }

    /// Sets the transaction state of a data element. Returns `false` for
    /// collections and unknown cookies.
    pub(crate) fn set_transaction_state(&mut self, cookie: Cookie, state: TransactionState) -> bool {
        match self.element_mut(cookie) {
            Some(element) if element.is_data() => {
                element.set_transaction_state(state);
                true
            },
            _ => false,
        }
    }

    /// Returns the report a data element still waits for, or [`None`] if the
    /// element is not pending.
    pub(crate) fn pending_field(&self, cookie: Cookie) -> Option<ReportField> {
        self.data_element(cookie)
            .filter(|element| element.transaction_state() == TransactionState::Pending)
            .and_then(Element::field)
    }
}

fn check_count(
    what: &str,
    report_type: ReportType,
    counts: [u32; ReportType::COUNT],
    actual: usize,
) -> Result<(), BuildError> {
    let expected = counts[report_type.index()] as usize;
    if expected != actual {
        return Err(BuildError::MalformedDescriptor(format!(
            "expected {expected} {report_type:?} {what} capabilities, got {actual}"
        )));
    }

    Ok(())
}

fn check_field_end(
    report_type: ReportType,
    bit_offset: u32,
    bit_width: u32,
) -> Result<(), BuildError> {
    if bit_offset.checked_add(bit_width).is_none() {
        return Err(BuildError::MalformedDescriptor(format!(
            "{report_type:?} field at bit {bit_offset} with {bit_width} bits ends out of range"
        )));
    }

    Ok(())
}

fn attach(
    elements: &mut Vec<Element>,
    dispatch: &mut DispatchTable,
    first_data: usize,
    parent: u32,
    element: Element,
) -> Result<(), BuildError> {
    if parent as usize >= first_data {
        return Err(BuildError::MalformedDescriptor(format!(
            "element {} has parent {parent}, which is not a collection",
            element.cookie().0
        )));
    }

    if let Some(field) = element.field() {
        dispatch.register(element.cookie(), field.report_type, field.report_id);
    }
    elements[parent as usize].add_child(element.cookie());
    elements.push(element);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{ButtonCap, CapabilityTable, CollectionNode, ValueCap};

    fn scenario() -> CapabilityTable {
        let mut table = CapabilityTable::new();
        let app = table.add_collection(CollectionNode {
            parent: 0,
            collection_type: 1,
            ..Default::default()
        });
        table.add_button(ReportType::Input, ButtonCap {
            parent: app,
            report_id: 0,
            bit_offset: 0,
            ..Default::default()
        });
        table.add_value(ReportType::Input, ValueCap {
            parent: app,
            report_id: 0,
            bit_offset: 1,
            bit_width: 8,
            logical_max: 255,
            ..Default::default()
        });
        table
    }

    #[test]
    fn builds_the_scenario_tree() {
        let tree = ElementTree::build(&scenario()).unwrap();

        assert_eq!(tree.len(), 4);
        assert_eq!(tree.first_data_cookie(), Cookie(2));
        assert_eq!(tree.root().children(), &[Cookie(1)]);
        assert_eq!(tree.element(Cookie(1)).unwrap().children(), &[Cookie(2), Cookie(3)]);
        assert_eq!(tree.element(Cookie(3)).unwrap().parent(), Some(Cookie(1)));
        assert_eq!(tree.report_count(), 1);
        assert!(!tree.uses_report_ids());
        assert_eq!(tree.max_report_bytes(), 2);
        assert_eq!(tree.value_store_handle().len(), 40);
    }

    #[test]
    fn records_follow_dispatch_order() {
        let tree = ElementTree::build(&scenario()).unwrap();

        // The value was registered last, so it heads the chain.
        let value = tree.element(Cookie(3)).unwrap().slot().unwrap();
        let button = tree.element(Cookie(2)).unwrap().slot().unwrap();
        assert_eq!(value, ValueSlot { offset: 0, size: 20 });
        assert_eq!(button, ValueSlot { offset: 20, size: 20 });

        let handle = tree.value_store_handle();
        assert_eq!(handle.read_element(button).unwrap().cookie, Cookie(2));
    }

    #[test]
    fn buttons_precede_values_of_every_type() {
        let mut table = scenario();
        table.add_button(ReportType::Feature, ButtonCap {
            parent: 1,
            report_id: 0,
            bit_offset: 0,
            ..Default::default()
        });
        let tree = ElementTree::build(&table).unwrap();

        let kinds: Vec<_> = tree
            .data_elements()
            .map(|element| element.field().unwrap().report_type)
            .collect();
        assert_eq!(kinds, vec![ReportType::Input, ReportType::Feature, ReportType::Input]);
    }

    #[test]
    fn rejects_forward_parents() {
        let mut table = scenario();
        table.collections[1].parent = 1;
        assert!(matches!(
            ElementTree::build(&table),
            Err(BuildError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn rejects_data_parents() {
        let mut table = scenario();
        table.buttons[0][0].parent = 2;
        assert!(matches!(
            ElementTree::build(&table),
            Err(BuildError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn rejects_zero_width_values() {
        let mut table = scenario();
        table.values[0][0].bit_width = 0;
        assert!(matches!(
            ElementTree::build(&table),
            Err(BuildError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn a_single_report_id_is_implied() {
        let mut table = scenario();
        table.buttons[0][0].report_id = 1;
        table.values[0][0].report_id = 1;
        let tree = ElementTree::build(&table).unwrap();

        assert_eq!(tree.report_count(), 1);
        assert!(!tree.uses_report_ids());
        assert_eq!(tree.report_id_of(&[0x83, 0x00]), 1);
        assert_eq!(tree.report_id_of(&[]), 1);
    }

    #[test]
    fn rejects_fields_ending_out_of_range() {
        let mut table = scenario();
        table.values[0][0].bit_offset = u32::MAX - 2;
        assert!(matches!(
            ElementTree::build(&table),
            Err(BuildError::MalformedDescriptor(_))
        ));

        let mut table = scenario();
        table.buttons[0][0].bit_offset = u32::MAX;
        assert!(matches!(
            ElementTree::build(&table),
            Err(BuildError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn rejects_missing_root() {
        let mut table = scenario();
        table.collections.clear();
        assert!(matches!(
            ElementTree::build(&table),
            Err(BuildError::MalformedDescriptor(_))
        ));
    }
}
