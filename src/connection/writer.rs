//! Write half of a physical connection.

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncWriteExt, BufWriter, WriteHalf},
    sync::mpsc,
};

use super::{AwaitingReply, Link, PendingRequest, Transport};
use crate::{bridge::BridgeCounters, metrics};

const WRITE_BUFFER: usize = 16 * 1024;

pub(super) struct Writer {
    io: BufWriter<WriteHalf<Box<dyn Transport>>>,
    awaiting: mpsc::UnboundedSender<AwaitingReply>,
    next_seq: u64,
    counters: Arc<BridgeCounters>,
}

impl Writer {
    pub(super) fn new(
        io: WriteHalf<Box<dyn Transport>>,
        awaiting: mpsc::UnboundedSender<AwaitingReply>,
        counters: Arc<BridgeCounters>,
    ) -> Self {
        Self {
            io: BufWriter::with_capacity(WRITE_BUFFER, io),
            awaiting,
            next_seq: 0,
            counters,
        }
    }

    /// Move `request` to the awaiting queue and return the bytes to write.
    ///
    /// The entry is queued before any byte reaches the transport, so the
    /// reader can never see a reply ahead of its entry. Returns `None` when
    /// the reader has already stopped; the request is then failed with the
    /// link's cause.
    pub(super) fn enqueue(&mut self, request: PendingRequest, link: &Link) -> Option<Bytes> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (payload, awaiting) = request.into_awaiting(seq);
        self.counters.written();
        if let Err(mpsc::error::SendError(awaiting)) = self.awaiting.send(awaiting) {
            self.counters.write_rejected();
            awaiting.fail(link.cause());
            return None;
        }
        metrics::inc_commands();
        tracing::trace!(seq, len = payload.len(), "request queued for write");
        Some(payload)
    }

    pub(super) async fn write(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.io.write_all(payload).await
    }

    pub(super) async fn flush(&mut self) -> std::io::Result<()> { self.io.flush().await }
}
