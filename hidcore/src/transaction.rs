//! Implements batched reads and writes of element values.
//!
//! A transaction is a list of cookies. All of its data elements are marked
//! pending when the transaction starts and are returned to idle when it ends,
//! no matter how it ends. Device I/O always happens without holding the
//! element lock.
//!
//! The shared transaction state only reflects what is in flight. Which
//! elements a transaction still has to serve is tracked by the transaction
//! itself, as concurrent transactions may return shared elements to idle at
//! any time.

use std::{collections::HashSet, error::Error, sync::Mutex};

use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    caps::ReportType,
    element::{Cookie, Element, ReportField, TransactionState},
    router::{ElementState, RouteError, lock},
    transport::ReportTransport,
};

/// Represents an error that occurred during a transaction.
#[derive(Debug, Error)]
pub enum TxError {
    /// A report buffer could not be allocated.
    #[error("could not allocate a report buffer")]
    NoMemory,

    /// The transport failed to exchange a report. The remaining reports of
    /// the transaction were not exchanged.
    #[error("the transport failed to exchange a report")]
    TransportFailure(#[source] Box<dyn Error + Send + Sync>),

    /// None of the cookies refer to a data element.
    #[error("no data element was found")]
    NotFound,

    /// A fetched report could not be routed.
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// A report assembled by a write transaction.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OutgoingReport {
    /// The type of the report.
    pub report_type: ReportType,

    /// The ID of the report.
    pub report_id: u8,

    /// The raw report, starting with the report ID if it carries one.
    pub data: Vec<u8>,
}

/// Marks the data elements of a transaction pending for as long as it lives.
struct PendingBatch<'a> {
    state: &'a Mutex<ElementState>,
    cookies: &'a [Cookie],
}

impl<'a> PendingBatch<'a> {
    /// Takes over `marked` elements that were marked pending by
    /// [`mark_pending`]. Fails if there are none.
    fn adopt(
        state: &'a Mutex<ElementState>,
        cookies: &'a [Cookie],
        marked: usize,
    ) -> Result<Self, TxError> {
        let batch = Self { state, cookies };
        if marked == 0 {
            return Err(TxError::NotFound);
        }

        Ok(batch)
    }
}

/// Marks every data element of `cookies` pending, returning their fields in
/// the order they are listed.
fn mark_pending(state: &mut ElementState, cookies: &[Cookie]) -> Vec<(Cookie, ReportField)> {
    let mut fields = Vec::new();
    for cookie in cookies {
        let field = state.tree.data_element(*cookie).and_then(Element::field);
        if let Some(field) = field {
            state.tree.set_transaction_state(*cookie, TransactionState::Pending);
            fields.push((*cookie, field));
        }
    }

    fields
}

impl Drop for PendingBatch<'_> {
    fn drop(&mut self) {
        let mut guard = lock(self.state);
        for cookie in self.cookies {
            guard.tree.set_transaction_state(*cookie, TransactionState::Idle);
        }
    }
}

impl ElementState {
    /// Serializes every report a write transaction touches, one buffer per
    /// distinct report type and ID, in the order the reports are first
    /// referenced.
    ///
    /// A report is assembled from all of its elements, not only from the ones
    /// listed in `cookies`.
    pub fn assemble_reports(&mut self, cookies: &[Cookie]) -> Result<Vec<OutgoingReport>, TxError> {
        let mut reports = Vec::new();

        for cookie in cookies {
            let Some(field) = self.tree.pending_field(*cookie) else {
                continue;
            };

            let data = self
                .tree
                .serialize_report(field.report_type, field.report_id)
                .map_err(|_| TxError::NoMemory)?;

            // Elements not fitting the report never leave the pending state
            // on their own.
            self.tree
                .set_transaction_state(*cookie, TransactionState::Idle);

            reports.push(OutgoingReport {
                report_type: field.report_type,
                report_id: field.report_id,
                data,
            });
        }

        Ok(reports)
    }
}

/// Refreshes the values of a batch of elements by fetching their reports.
///
/// Each report is fetched at most once, as routing it satisfies all pending
/// elements it carries.
pub(crate) async fn update_element_values<T: ReportTransport + ?Sized>(
    state: &Mutex<ElementState>,
    transport: &T,
    cookies: &[Cookie],
    clock: impl Fn() -> u64,
) -> Result<(), TxError> {
    let (fields, len) = {
        let mut guard = lock(state);
        (mark_pending(&mut guard, cookies), guard.tree.max_report_bytes())
    };
    let batch = PendingBatch::adopt(state, cookies, fields.len())?;

    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| TxError::NoMemory)?;
    buf.resize(len, 0);

    let mut fetched = HashSet::new();
    for (cookie, field) in &fields {
        if !fetched.insert((field.report_type, field.report_id)) {
            continue;
        }

        buf.fill(0);
        let read = transport
            .get_report(field.report_type, field.report_id, &mut buf)
            .await
            .map_err(|err| {
                warn!(report_type = ?field.report_type, report_id = field.report_id, "could not get report: {err}");
                TxError::TransportFailure(err)
            })?;

        lock(state).route(&buf[..read.min(buf.len())], field.report_type, clock())?;

        trace!(cookie = cookie.0, report_id = field.report_id, "fetched report");
    }

    drop(batch);
    Ok(())
}

/// Sends the current values of a batch of elements to the device.
///
/// Reports are sent in order and the first failure aborts the transaction.
pub(crate) async fn post_element_values<T: ReportTransport + ?Sized>(
    state: &Mutex<ElementState>,
    transport: &T,
    cookies: &[Cookie],
) -> Result<(), TxError> {
    // Marking and assembling share one critical section, so no concurrent
    // transaction can return the elements to idle in between.
    let (marked, reports) = {
        let mut guard = lock(state);
        let marked = mark_pending(&mut guard, cookies).len();
        (marked, guard.assemble_reports(cookies))
    };
    let batch = PendingBatch::adopt(state, cookies, marked)?;
    let reports = reports?;

    for report in &reports {
        transport
            .set_report(report.report_type, report.report_id, &report.data)
            .await
            .map_err(|err| {
                warn!(report_type = ?report.report_type, report_id = report.report_id, "could not set report: {err}");
                TxError::TransportFailure(err)
            })?;

        trace!(report_id = report.report_id, len = report.data.len(), "sent report");
    }

    drop(batch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, PoisonError};

    use async_trait::async_trait;
    use futures::executor::block_on;

    use super::*;
    use crate::{
        caps::{ButtonCap, CapabilityTable, CollectionNode, ValueCap},
        tree::ElementTree,
    };

    /// Two output reports: ID 2 with a button and a value, ID 3 with a value.
    fn output_state() -> ElementState {
        let mut table = CapabilityTable::new();
        let app = table.add_collection(CollectionNode::default());
        table.add_button(ReportType::Output, ButtonCap {
            parent: app,
            report_id: 2,
            bit_offset: 8,
            ..Default::default()
        });
        table.add_value(ReportType::Output, ValueCap {
            parent: app,
            report_id: 2,
            bit_offset: 12,
            bit_width: 4,
            logical_max: 15,
            ..Default::default()
        });
        table.add_value(ReportType::Output, ValueCap {
            parent: app,
            report_id: 3,
            bit_offset: 8,
            bit_width: 16,
            logical_max: 0xffff,
            ..Default::default()
        });
        table.add_report_bits(2, ReportType::Output, 16);
        table.add_report_bits(3, ReportType::Output, 32);

        ElementState::new(ElementTree::build(&table).unwrap())
    }

    #[test]
    fn coalesces_elements_of_one_report() {
        let mut state = output_state();
        state.tree.stage(Cookie(2), 1, 0);
        state.tree.stage(Cookie(3), 0xa, 0);

        // Only the value is listed, the button still ends up in the report.
        mark_pending(&mut state, &[Cookie(3)]);
        let reports = state.assemble_reports(&[Cookie(3)]).unwrap();

        assert_eq!(reports, vec![OutgoingReport {
            report_type: ReportType::Output,
            report_id: 2,
            data: vec![2, 0xa1],
        }]);
    }

    #[test]
    fn one_buffer_per_report() {
        let mut state = output_state();
        state.tree.stage(Cookie(4), 0x1234, 0);

        let cookies = [Cookie(2), Cookie(4), Cookie(3)];
        mark_pending(&mut state, &cookies);
        let reports = state.assemble_reports(&cookies).unwrap();

        let ids: Vec<_> = reports.iter().map(|r| r.report_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(reports[1].data, vec![3, 0x34, 0x12, 0]);
        assert!(
            state
                .tree
                .data_elements()
                .all(|e| e.transaction_state() == TransactionState::Idle)
        );
    }

    #[test]
    fn idle_elements_are_not_assembled() {
        let mut state = output_state();
        let reports = state.assemble_reports(&[Cookie(2), Cookie(0), Cookie(99)]).unwrap();
        assert!(reports.is_empty());
    }

    fn single_output_state(report_id: u8, bit_offset: u32) -> ElementState {
        let mut table = CapabilityTable::new();
        let app = table.add_collection(CollectionNode::default());
        table.add_value(ReportType::Output, ValueCap {
            parent: app,
            report_id,
            bit_offset,
            bit_width: 8,
            logical_max: 255,
            ..Default::default()
        });

        ElementState::new(ElementTree::build(&table).unwrap())
    }

    #[test]
    fn single_report_ids_lead_reports_with_a_free_first_byte() {
        let mut state = single_output_state(4, 8);
        state.tree.stage(Cookie(2), 0x5a, 0);
        mark_pending(&mut state, &[Cookie(2)]);

        let reports = state.assemble_reports(&[Cookie(2)]).unwrap();
        assert_eq!(reports[0].data, vec![4, 0x5a]);
    }

    #[test]
    fn single_report_ids_leave_occupied_first_bytes_alone() {
        let mut state = single_output_state(4, 0);
        state.tree.stage(Cookie(2), 0x5a, 0);
        mark_pending(&mut state, &[Cookie(2)]);

        let reports = state.assemble_reports(&[Cookie(2)]).unwrap();
        assert_eq!(reports[0].report_id, 4);
        assert_eq!(reports[0].data, vec![0x5a]);
    }

    #[test]
    fn staged_values_are_truncated() {
        let mut state = output_state();
        state.tree.stage(Cookie(3), 0x1f, 0);
        mark_pending(&mut state, &[Cookie(3)]);

        let reports = state.assemble_reports(&[Cookie(3)]).unwrap();
        assert_eq!(reports[0].data, vec![2, 0xf0]);
    }

    /// Returns every element to idle on each exchange, like a concurrent
    /// transaction finishing while this one waits for the device.
    struct IdlingTransport {
        state: Arc<Mutex<ElementState>>,
        exchanged: Mutex<Vec<(ReportType, u8)>>,
    }

    impl IdlingTransport {
        fn new(state: &Arc<Mutex<ElementState>>) -> Self {
            Self {
                state: Arc::clone(state),
                exchanged: Mutex::new(Vec::new()),
            }
        }

        fn exchange(&self, report_type: ReportType, report_id: u8) {
            let mut guard = lock(&self.state);
            let cookies: Vec<_> = guard.tree.data_elements().map(Element::cookie).collect();
            for cookie in cookies {
                guard.tree.set_transaction_state(cookie, TransactionState::Idle);
            }

            self.exchanged
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((report_type, report_id));
        }

        fn exchanged(&self) -> Vec<(ReportType, u8)> {
            self.exchanged.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    #[async_trait]
    impl ReportTransport for IdlingTransport {
        async fn get_report(
            &self,
            report_type: ReportType,
            report_id: u8,
            buf: &mut [u8],
        ) -> Result<usize, Box<dyn Error + Sync + Send>> {
            self.exchange(report_type, report_id);
            buf.fill(0xff);
            buf[0] = report_id;
            Ok(buf.len())
        }

        async fn set_report(
            &self,
            report_type: ReportType,
            report_id: u8,
            _data: &[u8],
        ) -> Result<(), Box<dyn Error + Sync + Send>> {
            self.exchange(report_type, report_id);
            Ok(())
        }

        async fn read_report(&self, _buf: &mut [u8]) -> Result<usize, Box<dyn Error + Sync + Send>> {
            Err("no input reports".into())
        }
    }

    #[test]
    fn updates_fetch_reports_other_transactions_went_idle_on() {
        let state = Arc::new(Mutex::new(output_state()));
        lock(&state).set_ready(true);
        let transport = IdlingTransport::new(&state);

        block_on(update_element_values(&state, &transport, &[Cookie(2), Cookie(4)], || 1))
            .unwrap();

        assert_eq!(transport.exchanged(), vec![
            (ReportType::Output, 2),
            (ReportType::Output, 3),
        ]);
        assert_eq!(lock(&state).tree.element(Cookie(4)).unwrap().logical_value(), 0xffff);
    }

    #[test]
    fn posts_send_reports_other_transactions_went_idle_on() {
        let state = Arc::new(Mutex::new(output_state()));
        let transport = IdlingTransport::new(&state);

        block_on(post_element_values(&state, &transport, &[Cookie(2), Cookie(4)])).unwrap();

        assert_eq!(transport.exchanged(), vec![
            (ReportType::Output, 2),
            (ReportType::Output, 3),
        ]);
    }
}
