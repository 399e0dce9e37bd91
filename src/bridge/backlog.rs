//! Outbound request queues owned by a bridge.
//!
//! Callers push into two bounded channels, one per priority. The writer of
//! the current physical connection holds the receiving [`Backlog`] and always
//! drains high-priority requests first, so a high-priority request overtakes
//! queued normal ones but never one that has already been taken for writing.
//! FIFO order holds within each priority.

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::mpsc::{self, error::TrySendError};

use super::status::BridgeCounters;
use crate::connection::PendingRequest;

/// Why a request was not queued. The request is handed back.
#[derive(Debug)]
pub(crate) enum Rejected {
    Full(PendingRequest),
    Closed(PendingRequest),
}

/// Producer side of a bridge backlog.
#[derive(Debug)]
pub(crate) struct BacklogSender {
    high: mpsc::Sender<PendingRequest>,
    low: mpsc::Sender<PendingRequest>,
    counters: Arc<BridgeCounters>,
}

impl BacklogSender {
    /// Queue `request` without waiting.
    pub(crate) fn try_push(&self, request: PendingRequest) -> Result<(), Rejected> {
        let tx = if request.flags().is_high_priority() {
            &self.high
        } else {
            &self.low
        };
        match tx.try_send(request) {
            Ok(()) => {
                self.counters.submitted();
                Ok(())
            }
            Err(TrySendError::Full(request)) => Err(Rejected::Full(request)),
            Err(TrySendError::Closed(request)) => Err(Rejected::Closed(request)),
        }
    }
}

/// Consumer side of a bridge backlog, held by the active writer.
#[derive(Debug)]
pub(crate) struct Backlog {
    high: mpsc::Receiver<PendingRequest>,
    low: mpsc::Receiver<PendingRequest>,
    /// Requests taken from the queues but handed back unwritten.
    carried: VecDeque<PendingRequest>,
    counters: Arc<BridgeCounters>,
}

/// Create a backlog holding up to `capacity` requests per priority.
pub(crate) fn backlog(capacity: usize, counters: Arc<BridgeCounters>) -> (BacklogSender, Backlog) {
    let capacity = capacity.max(1);
    let (high_tx, high_rx) = mpsc::channel(capacity);
    let (low_tx, low_rx) = mpsc::channel(capacity);
    (
        BacklogSender {
            high: high_tx,
            low: low_tx,
            counters: Arc::clone(&counters),
        },
        Backlog {
            high: high_rx,
            low: low_rx,
            carried: VecDeque::new(),
            counters,
        },
    )
}

impl Backlog {
    /// Take the next request if one is ready.
    pub(crate) fn try_next(&mut self) -> Option<PendingRequest> {
        let request = match self.carried.pop_front() {
            Some(request) => request,
            None => self.high.try_recv().or_else(|_| self.low.try_recv()).ok()?,
        };
        self.counters.dequeued();
        Some(request)
    }

    /// Wait for the next request, preferring high priority.
    ///
    /// Returns `None` once both queues are closed and empty.
    pub(crate) async fn next(&mut self) -> Option<PendingRequest> {
        if let Some(request) = self.carried.pop_front() {
            self.counters.dequeued();
            return Some(request);
        }
        let mut high_closed = false;
        let mut low_closed = false;
        let request = loop {
            tokio::select! {
                biased;
                res = self.high.recv(), if !high_closed => match res {
                    Some(request) => break request,
                    None => high_closed = true,
                },
                res = self.low.recv(), if !low_closed => match res {
                    Some(request) => break request,
                    None => low_closed = true,
                },
                else => return None,
            }
        };
        self.counters.dequeued();
        Some(request)
    }

    /// Return an unwritten request to the front of the backlog.
    pub(crate) fn carry(&mut self, request: PendingRequest) {
        self.counters.requeued();
        self.carried.push_front(request);
    }

    /// Close both queues and take everything left in them.
    ///
    /// The drained requests still count as queued until they are failed.
    pub(crate) fn close_and_drain(&mut self) -> Vec<PendingRequest> {
        self.high.close();
        self.low.close();
        let mut drained: Vec<_> = self.carried.drain(..).collect();
        for rx in [&mut self.high, &mut self.low] {
            while let Ok(request) = rx.try_recv() {
                drained.push(request);
            }
        }
        drained
    }
}
