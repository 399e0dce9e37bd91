//! Read half of a physical connection.
//!
//! The reader owns the consuming end of the awaiting-reply queue. Every
//! decoded value either completes the head of that queue or, on subscription
//! connections, is handed to pub/sub delivery.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, ReadHalf},
    sync::mpsc,
};

use super::{AwaitingReply, ConnectionKind, Delivered, Link, Transport};
use crate::{
    bridge::BridgeCounters,
    error::ConnectionError,
    metrics,
    pubsub::{Delivery, PubSubMessage},
    resp::{Cursor, DecoderLimits, RespDecoder, RespValue, SegmentedBuf},
};

const READ_CHUNK: usize = 8 * 1024;

pub(super) struct Reader {
    io: ReadHalf<Box<dyn Transport>>,
    decoder: RespDecoder,
    chain: SegmentedBuf,
    cursor: Cursor,
    awaiting: mpsc::UnboundedReceiver<AwaitingReply>,
    kind: ConnectionKind,
    delivery: Option<Delivery>,
    counters: Arc<BridgeCounters>,
    link: Arc<Link>,
}

impl Reader {
    #[expect(
        clippy::too_many_arguments,
        reason = "the reader owns every piece of per-connection receive state"
    )]
    pub(super) fn new(
        io: ReadHalf<Box<dyn Transport>>,
        limits: DecoderLimits,
        awaiting: mpsc::UnboundedReceiver<AwaitingReply>,
        kind: ConnectionKind,
        delivery: Option<Delivery>,
        counters: Arc<BridgeCounters>,
        link: Arc<Link>,
    ) -> Self {
        Self {
            io,
            decoder: RespDecoder::new(limits),
            chain: SegmentedBuf::new(),
            cursor: Cursor::new(),
            awaiting,
            kind,
            delivery,
            counters,
            link,
        }
    }

    /// Read until the connection fails, then fail every outstanding entry.
    pub(super) async fn run(mut self) {
        let cause = self.read_loop().await;
        self.link.fail(cause);
        self.awaiting.close();
        let cause = self.link.cause();
        let mut failed = 0_u64;
        while let Some(entry) = self.awaiting.recv().await {
            if entry.fail(cause.clone()) == Delivered::Abandoned {
                metrics::inc_abandoned();
            }
            self.counters.failed_awaiting();
            failed += 1;
        }
        if failed > 0 {
            tracing::debug!(failed, error = %cause, "failed requests awaiting replies");
        }
    }

    async fn read_loop(&mut self) -> ConnectionError {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            let read = tokio::select! {
                biased;
                () = self.link.cancelled() => return self.link.cause(),
                read = self.io.read_buf(&mut buf) => read,
            };
            match read {
                Ok(0) => return ConnectionError::Closed,
                Ok(_) => self.chain.push(buf.split().freeze()),
                Err(e) => return e.into(),
            }
            if let Err(e) = self.drain_values() {
                return e;
            }
        }
    }

    /// Decode and dispatch every complete value currently buffered.
    fn drain_values(&mut self) -> Result<(), ConnectionError> {
        loop {
            let value = match self.decoder.try_parse(&self.chain, &mut self.cursor) {
                Ok(Some(value)) => value,
                Ok(None) => break,
                Err(e) => {
                    metrics::inc_decode_errors();
                    return Err(e.into());
                }
            };
            self.dispatch(value)?;
        }
        self.chain.release(&mut self.cursor);
        Ok(())
    }

    fn dispatch(&mut self, value: RespValue) -> Result<(), ConnectionError> {
        if self.kind == ConnectionKind::Subscription
            && let Some(delivery) = &self.delivery
            && let Some(message) = PubSubMessage::from_push(&value)
        {
            delivery.deliver(message);
            return Ok(());
        }
        let Ok(entry) = self.awaiting.try_recv() else {
            tracing::warn!(reply = %value, "reply with no awaiting request");
            return Err(ConnectionError::UnexpectedReply);
        };
        metrics::inc_replies();
        let seq = entry.seq();
        match entry.complete(value) {
            Delivered::Abandoned => {
                metrics::inc_abandoned();
                tracing::debug!(seq, "caller abandoned reply");
            }
            Delivered::Caller | Delivered::Discarded => {}
        }
        self.counters.completed();
        Ok(())
    }
}
