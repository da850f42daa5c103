//! Routes arriving reports to the elements they carry.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::trace;

use crate::{caps::ReportType, subscription::SubscriptionTable, tree::ElementTree};

/// Represents an error that occurred while routing a report.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
pub enum RouteError {
    /// The report buffer is empty.
    #[error("the report buffer is empty")]
    BadArgument,

    /// The device does not accept input reports at the moment.
    #[error("the device is not ready for reports")]
    NotReady,
}

/// Everything guarded by the element lock of a device.
#[derive(Debug)]
pub struct ElementState {
    pub(crate) tree: ElementTree,
    pub(crate) subscriptions: SubscriptionTable,
    ready: bool,
}

impl ElementState {
    /// Wraps a freshly built tree. The state starts out not ready.
    pub fn new(tree: ElementTree) -> Self {
        Self {
            tree,
            subscriptions: SubscriptionTable::new(),
            ready: false,
        }
    }

    /// The element tree.
    pub fn tree(&self) -> &ElementTree {
        &self.tree
    }

    /// The subscriptions of all elements.
    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    /// Whether reports are routed at all.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Enables or disables routing.
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Routes a report to all elements of its dispatch chain.
    ///
    /// Every element whose value changed is reported to its subscribers.
    /// Returns whether any value changed.
    pub fn route(
        &mut self,
        report: &[u8],
        report_type: ReportType,
        timestamp: u64,
    ) -> Result<bool, RouteError> {
        if report.is_empty() {
            return Err(RouteError::BadArgument);
        }

        if !self.ready {
            return Err(RouteError::NotReady);
        }

        let subscriptions = &self.subscriptions;
        let changed = self
            .tree
            .consume(report_type, report, timestamp, |element| subscriptions.notify(element));

        trace!(
            ?report_type,
            report_id = self.tree.report_id_of(report),
            len = report.len(),
            changed,
            "routed report"
        );

        Ok(changed)
    }
}

/// Acquires the element lock. A poisoned lock is taken over as is, the state
/// it guards stays consistent between single element updates.
pub(crate) fn lock(state: &Mutex<ElementState>) -> MutexGuard<'_, ElementState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
