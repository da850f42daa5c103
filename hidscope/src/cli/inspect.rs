use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Args;
use hidcore::{
    element::{Cookie, Element, ElementKind, ReportField, ValueRange},
    tree::ElementTree,
};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::{Cli, SourceArgs};

/// Build the element tree of a device and view its layout.
#[derive(Args)]
pub struct InspectCommand {
    #[command(flatten)]
    source: SourceArgs,
}

impl InspectCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let table = self.source.load()?;
        let tree = ElementTree::build(&table).context("could not build the element tree")?;

        if root.json {
            writeln!(stdout, "{}", json!(InspectedTree::new(&tree))).unwrap();
            return Ok(());
        }

        writeln!(
            stdout,
            "{} elements, {} report(s){}, {} bytes of values",
            tree.len(),
            tree.report_count(),
            if tree.uses_report_ids() {
                " with IDs"
            } else {
                ""
            },
            tree.value_store_handle().len().bright_black()
        )
        .unwrap();
        writeln!(stdout).unwrap();

        write_element(&mut stdout, &tree, tree.root(), "", None);

        stdout.flush().unwrap();

        Ok(())
    }
}

/// Draws an element and, below it, all of its descendants.
///
/// `last` is `None` for the root, which is drawn without a branch.
fn write_element(
    stdout: &mut impl Write,
    tree: &ElementTree,
    element: &Element,
    prefix: &str,
    last: Option<bool>,
) {
    let branch = match last {
        None => "",
        Some(true) => " ╰─ ",
        Some(false) => " ├─ ",
    };
    writeln!(stdout, "{prefix}{branch}{}", describe(element)).unwrap();

    let child_prefix = match last {
        None => prefix.to_string(),
        Some(true) => format!("{prefix}    "),
        Some(false) => format!("{prefix} │  "),
    };

    let children = element.children();
    for (i, cookie) in children.iter().enumerate() {
        if let Some(child) = tree.element(*cookie) {
            write_element(stdout, tree, child, &child_prefix, Some(i == children.len() - 1));
        }
    }
}

fn describe(element: &Element) -> String {
    let usage = format!("({:#06x}:{:#06x})", element.usage_page(), element.usage());

    match (element.kind(), element.field()) {
        (ElementKind::Collection, _) if element.cookie() == Cookie::ROOT => {
            format!("{} {}", element.cookie().bright_black(), "root".italic())
        },
        (ElementKind::Collection, _) => format!(
            "{} {} {}",
            element.cookie().bright_black(),
            collection_name(element.collection_type()).bright_blue(),
            usage.bright_black()
        ),
        (kind, Some(field)) => {
            let mut line = format!(
                "{} {} {} {:?} report {}, bits {}..{}",
                element.cookie().bright_black(),
                format!("{kind:?}").green(),
                usage.bright_black(),
                field.report_type,
                field.report_id,
                field.bit_offset,
                field.bit_offset + field.bit_width,
            );
            if let Some(range) = element.range() {
                line.push_str(&format!(
                    " [{}..={}{}]",
                    range.logical_min,
                    range.logical_max,
                    if range.signed { ", signed" } else { "" }
                ));
            }
            line
        },
        (kind, None) => format!("{} {kind:?}", element.cookie().bright_black()),
    }
}

fn collection_name(collection_type: u8) -> &'static str {
    match collection_type {
        0x00 => "Physical",
        0x01 => "Application",
        0x02 => "Logical",
        0x03 => "Report",
        0x04 => "Named Array",
        0x05 => "Usage Switch",
        0x06 => "Usage Modifier",
        _ => "Vendor",
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct InspectedTree {
    report_count: usize,
    uses_report_ids: bool,
    max_report_bytes: usize,
    value_store_bytes: usize,
    elements: Vec<InspectedElement>,
}

impl InspectedTree {
    fn new(tree: &ElementTree) -> Self {
        Self {
            report_count: tree.report_count(),
            uses_report_ids: tree.uses_report_ids(),
            max_report_bytes: tree.max_report_bytes(),
            value_store_bytes: tree.value_store_handle().len(),
            elements: tree.elements().iter().map(InspectedElement::new).collect(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct InspectedElement {
    cookie: Cookie,
    kind: ElementKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<Cookie>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<Cookie>,

    #[serde(skip_serializing_if = "Option::is_none")]
    collection_type: Option<u8>,

    usage_page: u16,
    usage: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<ReportField>,

    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<ValueRange>,
}

impl InspectedElement {
    fn new(element: &Element) -> Self {
        Self {
            cookie: element.cookie(),
            kind: element.kind(),
            parent: element.parent(),
            children: element.children().to_vec(),
            collection_type: (!element.is_data()).then(|| element.collection_type()),
            usage_page: element.usage_page(),
            usage: element.usage(),
            field: element.field(),
            range: element.range(),
        }
    }
}
