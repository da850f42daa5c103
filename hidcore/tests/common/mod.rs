//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    error::Error,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use hidcore::{
    async_trait,
    caps::{ButtonCap, CapabilityTable, CollectionNode, ReportType, ValueCap},
    element::Cookie,
    transport::ReportTransport,
};

/// The cookies of [`multi_report_table`].
pub mod cookies {
    use hidcore::element::Cookie;

    pub const APP: Cookie = Cookie(1);
    pub const IN_BUTTON: Cookie = Cookie(2);
    pub const OUT_BUTTON: Cookie = Cookie(3);
    pub const IN_VALUE: Cookie = Cookie(4);
    pub const IN_SHARED_SLOT: Cookie = Cookie(5);
    pub const OUT_VALUE: Cookie = Cookie(6);
    pub const FEATURE_VALUE: Cookie = Cookie(7);
}

/// One collection with an input button at bit 0 and an 8 bit input value at
/// bits 1 to 8, without report IDs.
pub fn scenario_table() -> CapabilityTable {
    let mut table = CapabilityTable::new();
    let app = table.add_collection(CollectionNode {
        parent: 0,
        collection_type: 1,
        usage_page: 0x01,
        usage: 0x05,
    });
    table.add_button(ReportType::Input, ButtonCap {
        parent: app,
        report_id: 0,
        bit_offset: 0,
        usage_page: 0x09,
        usage: 0x01,
    });
    table.add_value(ReportType::Input, ValueCap {
        parent: app,
        report_id: 0,
        bit_offset: 1,
        bit_width: 8,
        signed: false,
        logical_min: 0,
        logical_max: 255,
        usage_page: 0x01,
        usage: 0x30,
    });
    table
}

/// A device using report IDs:
///
/// | report        | bits   | element                      |
/// |---------------|--------|------------------------------|
/// | input 1       | 8      | button                       |
/// | input 1       | 16..24 | 8 bit value                  |
/// | input 9       | 8..16  | 8 bit value (shares slot 1)  |
/// | output 3      | 8      | button                       |
/// | output 3      | 12..16 | 4 bit value                  |
/// | feature 2     | 8..24  | signed 16 bit value          |
pub fn multi_report_table() -> CapabilityTable {
    let mut table = CapabilityTable::new();
    let app = table.add_collection(CollectionNode {
        parent: 0,
        collection_type: 1,
        ..Default::default()
    });

    table.add_button(ReportType::Input, ButtonCap {
        parent: app,
        report_id: 1,
        bit_offset: 8,
        ..Default::default()
    });
    table.add_button(ReportType::Output, ButtonCap {
        parent: app,
        report_id: 3,
        bit_offset: 8,
        ..Default::default()
    });

    table.add_value(ReportType::Input, ValueCap {
        parent: app,
        report_id: 1,
        bit_offset: 16,
        bit_width: 8,
        logical_max: 255,
        ..Default::default()
    });
    table.add_value(ReportType::Input, ValueCap {
        parent: app,
        report_id: 9,
        bit_offset: 8,
        bit_width: 8,
        logical_max: 255,
        ..Default::default()
    });
    table.add_value(ReportType::Output, ValueCap {
        parent: app,
        report_id: 3,
        bit_offset: 12,
        bit_width: 4,
        logical_max: 15,
        ..Default::default()
    });
    table.add_value(ReportType::Feature, ValueCap {
        parent: app,
        report_id: 2,
        bit_offset: 8,
        bit_width: 16,
        signed: true,
        logical_min: -32768,
        logical_max: 32767,
        ..Default::default()
    });

    table.add_report_bits(1, ReportType::Input, 24);
    table.add_report_bits(9, ReportType::Input, 16);
    table.add_report_bits(3, ReportType::Output, 16);
    table.add_report_bits(2, ReportType::Feature, 24);
    table
}

#[derive(Debug)]
pub struct MockError(pub &'static str);

impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Error for MockError {}

/// The recorded traffic and the canned answers of a [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockState {
    /// Answers to `get_report`, by type and ID.
    pub reports: HashMap<(ReportType, u8), Vec<u8>>,

    /// Every `get_report` call, in order.
    pub fetches: Vec<(ReportType, u8)>,

    /// Every successful `set_report` call, in order.
    pub sent: Vec<(ReportType, u8, Vec<u8>)>,

    /// Makes every `get_report` call fail.
    pub fail_get: bool,

    /// Makes `set_report` fail once this many reports were sent.
    pub fail_set_after: Option<usize>,
}

/// A transport answering from canned reports and recording everything sent
/// to it. Clones share their state.
#[derive(Clone)]
pub struct MockTransport {
    pub state: Arc<Mutex<MockState>>,
    inbound_tx: flume::Sender<Vec<u8>>,
    inbound_rx: flume::Receiver<Vec<u8>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            inbound_tx,
            inbound_rx,
        }
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the answer to `get_report` for a report.
    pub fn set_answer(&self, report_type: ReportType, report_id: u8, data: &[u8]) {
        self.lock().reports.insert((report_type, report_id), data.to_vec());
    }

    /// Queues an input report for `read_report`.
    pub fn push_input(&self, data: &[u8]) {
        let _ = self.inbound_tx.send(data.to_vec());
    }

    pub fn fetches(&self) -> Vec<(ReportType, u8)> {
        self.lock().fetches.clone()
    }

    pub fn sent(&self) -> Vec<(ReportType, u8, Vec<u8>)> {
        self.lock().sent.clone()
    }
}

#[async_trait]
impl ReportTransport for MockTransport {
    async fn get_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        buf: &mut [u8],
    ) -> Result<usize, Box<dyn Error + Sync + Send>> {
        let mut state = self.lock();
        state.fetches.push((report_type, report_id));

        if state.fail_get {
            return Err(Box::new(MockError("get_report failed")));
        }

        let data = state
            .reports
            .get(&(report_type, report_id))
            .ok_or(MockError("no such report"))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    async fn set_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), Box<dyn Error + Sync + Send>> {
        let mut state = self.lock();
        if state.fail_set_after == Some(state.sent.len()) {
            return Err(Box::new(MockError("set_report failed")));
        }

        state.sent.push((report_type, report_id, data.to_vec()));
        Ok(())
    }

    async fn read_report(&self, buf: &mut [u8]) -> Result<usize, Box<dyn Error + Sync + Send>> {
        let data = self.inbound_rx.recv_async().await?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }
}

/// Collects all data element cookies of a device.
pub fn data_cookies(tree: &hidcore::tree::ElementTree) -> Vec<Cookie> {
    tree.data_elements().map(|element| element.cookie()).collect()
}
