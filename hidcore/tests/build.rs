mod common;

use std::{convert::Infallible, error::Error};

use common::{MockError, MockTransport, cookies, multi_report_table, scenario_table};
use hidcore::{
    caps::{
        ButtonCap,
        Capabilities,
        CapabilitySource,
        CapabilityTable,
        CollectionNode,
        ReportType,
        ValueCap,
    },
    device::HidDevice,
    element::{Cookie, ElementKind, TransactionState},
    tree::{BuildError, ElementTree},
};

#[test]
fn element_count_covers_collections_buttons_and_values() {
    let table = multi_report_table();
    let caps = table.capabilities().unwrap();
    let tree = ElementTree::build(&table).unwrap();

    let expected = caps.collection_count
        + caps.button_counts.iter().sum::<u32>()
        + caps.value_counts.iter().sum::<u32>();
    assert_eq!(tree.len(), expected as usize);
    assert_eq!(tree.len(), 8);
}

#[test]
fn elements_are_ordered_collections_buttons_values() {
    let tree = ElementTree::build(&multi_report_table()).unwrap();

    let kinds: Vec<_> = tree.elements().iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec![
        ElementKind::Collection,
        ElementKind::Collection,
        ElementKind::Button,
        ElementKind::Button,
        ElementKind::Value,
        ElementKind::Value,
        ElementKind::Value,
        ElementKind::Value,
    ]);

    let types: Vec<_> = tree
        .data_elements()
        .map(|e| e.field().unwrap().report_type)
        .collect();
    assert_eq!(types, vec![
        ReportType::Input,
        ReportType::Output,
        ReportType::Input,
        ReportType::Input,
        ReportType::Output,
        ReportType::Feature,
    ]);

    for (index, element) in tree.elements().iter().enumerate() {
        assert_eq!(element.cookie(), Cookie(index as u32));
    }
}

#[test]
fn every_element_hangs_below_the_root() {
    let tree = ElementTree::build(&multi_report_table()).unwrap();

    assert_eq!(tree.root().parent(), None);
    assert_eq!(tree.root().children(), &[cookies::APP]);
    assert_eq!(tree.element(cookies::APP).unwrap().children().len(), 6);

    for element in tree.data_elements() {
        assert_eq!(element.parent(), Some(cookies::APP));
        assert_eq!(element.transaction_state(), TransactionState::Idle);
    }
}

#[test]
fn value_records_are_disjoint_and_cover_the_store() {
    let tree = ElementTree::build(&multi_report_table()).unwrap();

    let mut slots: Vec<_> = tree.data_elements().map(|e| e.slot().unwrap()).collect();
    slots.sort_by_key(|slot| slot.offset);

    let mut end = 0;
    for slot in &slots {
        assert_eq!(slot.offset, end);
        end += slot.size;
    }

    let total: usize = tree.data_elements().map(|e| e.value_size()).sum();
    assert_eq!(end, total);
    assert_eq!(tree.value_store_handle().len(), total);
}

#[test]
fn value_records_carry_their_cookie() {
    let tree = ElementTree::build(&multi_report_table()).unwrap();
    let handle = tree.value_store_handle();

    for element in tree.data_elements() {
        let record = handle.read_element(element.slot().unwrap()).unwrap();
        assert_eq!(record.cookie, element.cookie());
        assert_eq!(record.timestamp, 0);
    }
}

#[test]
fn report_ids_are_counted() {
    let tree = ElementTree::build(&multi_report_table()).unwrap();
    assert_eq!(tree.report_count(), 4);
    assert!(tree.uses_report_ids());
    assert_eq!(tree.report_bits(2, ReportType::Feature), Some(24));
    assert_eq!(tree.report_bits(2, ReportType::Input), None);
    assert_eq!(tree.max_report_bytes(), 3);

    let tree = ElementTree::build(&scenario_table()).unwrap();
    assert_eq!(tree.report_count(), 1);
    assert!(!tree.uses_report_ids());
}

#[test]
fn metadata_is_carried_over() {
    let tree = ElementTree::build(&scenario_table()).unwrap();

    let app = tree.element(Cookie(1)).unwrap();
    assert_eq!((app.collection_type(), app.usage_page(), app.usage()), (1, 0x01, 0x05));

    let value = tree.element(Cookie(3)).unwrap();
    assert_eq!((value.usage_page(), value.usage()), (0x01, 0x30));
    let range = value.range().unwrap();
    assert_eq!((range.logical_min, range.logical_max, range.signed), (0, 255, false));
}

/// A source whose declared counts disagree with the records it returns.
struct LyingSource(CapabilityTable);

impl CapabilitySource for LyingSource {
    type Error = Infallible;

    fn capabilities(&self) -> Result<Capabilities, Self::Error> {
        let mut caps = self.0.capabilities()?;
        caps.value_counts[0] += 1;
        Ok(caps)
    }

    fn collection_nodes(&self) -> Result<Vec<CollectionNode>, Self::Error> {
        self.0.collection_nodes()
    }

    fn button_caps(&self, report_type: ReportType) -> Result<Vec<ButtonCap>, Self::Error> {
        self.0.button_caps(report_type)
    }

    fn value_caps(&self, report_type: ReportType) -> Result<Vec<ValueCap>, Self::Error> {
        self.0.value_caps(report_type)
    }
}

#[test]
fn mismatching_counts_are_malformed() {
    let result = ElementTree::build(&LyingSource(scenario_table()));
    assert!(matches!(result, Err(BuildError::MalformedDescriptor(_))));
}

/// A source failing as soon as value capabilities are requested.
struct FailingSource(CapabilityTable);

impl CapabilitySource for FailingSource {
    type Error = MockError;

    fn capabilities(&self) -> Result<Capabilities, Self::Error> {
        Ok(self.0.capabilities().unwrap_or_default())
    }

    fn collection_nodes(&self) -> Result<Vec<CollectionNode>, Self::Error> {
        Ok(self.0.collections.clone())
    }

    fn button_caps(&self, report_type: ReportType) -> Result<Vec<ButtonCap>, Self::Error> {
        Ok(self.0.buttons[report_type.index()].clone())
    }

    fn value_caps(&self, _report_type: ReportType) -> Result<Vec<ValueCap>, Self::Error> {
        Err(MockError("no values today"))
    }
}

#[test]
fn source_errors_abort_the_build() {
    let result = ElementTree::build(&FailingSource(scenario_table()));

    let Err(BuildError::Source(err)) = result else {
        panic!("expected a source error");
    };
    assert_eq!(err.to_string(), "no values today");
}

#[test]
fn devices_surface_build_errors() {
    let mut table = scenario_table();
    table.values[0][0].parent = 7;

    let result = HidDevice::new(MockTransport::new(), &table);
    assert!(matches!(result, Err(BuildError::MalformedDescriptor(_))));
}

#[test]
fn empty_capabilities_build_a_lone_root() {
    let tree = ElementTree::build(&CapabilityTable::new()).unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.data_elements().count(), 0);
    assert!(tree.value_store_handle().is_empty());
    assert!(!tree.is_data(Cookie::ROOT));
}

#[test]
fn source_errors_keep_their_message_chain() {
    let err = ElementTree::build(&FailingSource(scenario_table())).unwrap_err();
    assert_eq!(err.to_string(), "the capability source failed");
    assert!(err.source().is_some());
}
