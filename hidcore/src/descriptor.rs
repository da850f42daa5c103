//! Turns raw report descriptors into capability tables.

use std::collections::HashMap;

use hidreport::{Collection, CollectionType, Field, ParserError, Report, ReportDescriptor, Usage};

use crate::caps::{ButtonCap, CapabilityTable, CollectionNode, ReportType, ValueCap};

impl CapabilityTable {
    /// Parses a raw report descriptor into a capability table.
    ///
    /// Variable fields one bit wide with a logical range of `0..=1` become
    /// buttons, all other variable fields become values. Array fields become
    /// one value per array slot. Constant fields are skipped. Collections are
    /// numbered in the order they are first seen, below the root collection.
    ///
    /// Bit offsets of reports with a report ID count the leading ID byte, so
    /// they address the report exactly as the device sends it.
    pub fn from_descriptor(bytes: &[u8]) -> Result<Self, ParserError> {
        let descriptor = ReportDescriptor::try_from(bytes)?;

        let mut table = CapabilityTable::new();
        let mut collections = HashMap::new();

        add_reports(
            &mut table,
            &mut collections,
            ReportType::Input,
            descriptor.input_reports(),
        );
        add_reports(
            &mut table,
            &mut collections,
            ReportType::Output,
            descriptor.output_reports(),
        );
        add_reports(
            &mut table,
            &mut collections,
            ReportType::Feature,
            descriptor.feature_reports(),
        );

        Ok(table)
    }
}

fn add_reports<R: Report>(
    table: &mut CapabilityTable,
    collections: &mut HashMap<Collection, u32>,
    report_type: ReportType,
    reports: &[R],
) {
    for report in reports {
        let report_id = report.report_id().as_ref().map(u8::from).unwrap_or(0);
        table.add_report_bits(report_id, report_type, report.size_in_bits() as u32);

        for field in report.fields() {
            match field {
                Field::Variable(var) => {
                    let parent = collection_index(table, collections, &var.collections);
                    let bit_offset = var.bits.start as u32;
                    let bit_width = var.bits.len() as u32;
                    let logical_min = i32::from(var.logical_minimum);
                    let logical_max = i32::from(var.logical_maximum);
                    let (usage_page, usage) = usage_parts(&var.usage);

                    if bit_width == 1 && logical_min == 0 && logical_max == 1 {
                        table.add_button(report_type, ButtonCap {
                            parent,
                            report_id,
                            bit_offset,
                            usage_page,
                            usage,
                        });
                    } else {
                        table.add_value(report_type, ValueCap {
                            parent,
                            report_id,
                            bit_offset,
                            bit_width,
                            signed: var.is_signed(),
                            logical_min,
                            logical_max,
                            usage_page,
                            usage,
                        });
                    }
                },
                Field::Array(arr) => {
                    let parent = collection_index(table, collections, &arr.collections);
                    let count = usize::from(arr.report_count).max(1);
                    let total = arr.bits.len();
                    let bit_width = (total / count) as u32;
                    if bit_width == 0 {
                        continue;
                    }

                    let logical_min = i32::from(arr.logical_minimum);
                    let (usage_page, usage) = arr.usages().first().map_or((0, 0), usage_parts);

                    for slot in 0..count as u32 {
                        table.add_value(report_type, ValueCap {
                            parent,
                            report_id,
                            bit_offset: arr.bits.start as u32 + slot * bit_width,
                            bit_width,
                            signed: logical_min < 0,
                            logical_min,
                            logical_max: i32::from(arr.logical_maximum),
                            usage_page,
                            usage,
                        });
                    }
                },
                Field::Constant(_) => {},
            }
        }
    }
}

/// Returns the index of the innermost collection of a field, registering all
/// collections of the path that were not seen before.
fn collection_index(
    table: &mut CapabilityTable,
    known: &mut HashMap<Collection, u32>,
    path: &[Collection],
) -> u32 {
    let mut parent = 0;

    for collection in path {
        parent = match known.get(collection) {
            Some(index) => *index,
            None => {
                let (usage_page, usage) = collection
                    .usages()
                    .first()
                    .map_or((0, 0), usage_parts);
                let index = table.add_collection(CollectionNode {
                    parent,
                    collection_type: collection_type_code(collection.collection_type()),
                    usage_page,
                    usage,
                });
                known.insert(collection.clone(), index);
                index
            },
        };
    }

    parent
}

fn usage_parts(usage: &Usage) -> (u16, u16) {
    (u16::from(usage.usage_page), u16::from(usage.usage_id))
}

fn collection_type_code(collection_type: CollectionType) -> u8 {
    match collection_type {
        CollectionType::Physical => 0x00,
        CollectionType::Application => 0x01,
        CollectionType::Logical => 0x02,
        CollectionType::Report => 0x03,
        CollectionType::NamedArray => 0x04,
        CollectionType::UsageSwitch => 0x05,
        CollectionType::UsageModifier => 0x06,
        _ => 0x80,
    }
}
