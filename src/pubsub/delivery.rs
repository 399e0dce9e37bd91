//! Running subscription handlers for incoming push messages.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{PubSubMessage, SubscriptionId, SubscriptionRegistry, registry::Handlers};
use crate::{dispatch::panic_message, metrics};

struct Job {
    message: PubSubMessage,
    handlers: Handlers,
    /// Await the handlers in turn rather than spawning them.
    ordered: bool,
}

/// Hands push messages to their handlers.
///
/// In ordered mode a single worker awaits every handler in turn, so handlers
/// observe messages in publish order. In concurrent mode each handler runs on
/// its own task and a slow handler does not hold back later messages.
///
/// While the worker still holds ordered jobs, concurrent messages queue
/// behind them and are spawned by the worker, so switching modes never lets
/// a message overtake one published before it.
#[derive(Clone, Debug)]
pub(crate) struct Delivery {
    registry: Arc<SubscriptionRegistry>,
    ordered: Arc<AtomicBool>,
    queue: mpsc::UnboundedSender<Job>,
    queued: Arc<AtomicUsize>,
    tracker: TaskTracker,
}

impl Delivery {
    /// Start the ordered worker on `tracker`. It stops when `shutdown` fires.
    pub(crate) fn start(
        registry: Arc<SubscriptionRegistry>,
        ordered: bool,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        tracker.spawn(run_worker(rx, Arc::clone(&queued), tracker.clone(), shutdown));
        Self {
            registry,
            ordered: Arc::new(AtomicBool::new(ordered)),
            queue,
            queued,
            tracker,
        }
    }

    pub(crate) fn registry(&self) -> &Arc<SubscriptionRegistry> { &self.registry }

    /// Switch between ordered and concurrent delivery.
    ///
    /// Messages already handed to the ordered worker are still delivered in
    /// order, and messages that arrive after a switch to concurrent mode
    /// start only once those are done.
    pub(crate) fn set_ordered(&self, ordered: bool) {
        self.ordered.store(ordered, Ordering::Relaxed);
    }

    pub(crate) fn is_ordered(&self) -> bool { self.ordered.load(Ordering::Relaxed) }

    /// Deliver `message` to every handler registered for its channel.
    pub(crate) fn deliver(&self, message: PubSubMessage) {
        let Some(handlers) = self.registry.handlers(&message.route()) else {
            tracing::debug!(channel = %message.channel.escape_ascii(), "no handler for message");
            return;
        };
        metrics::inc_pubsub_messages();
        let ordered = self.is_ordered();
        if !ordered && self.queued.load(Ordering::Acquire) == 0 {
            spawn_all(&self.tracker, &message, &handlers);
            return;
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        let job = Job {
            message,
            handlers,
            ordered,
        };
        if self.queue.send(job).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!("ordered delivery stopped; message dropped");
        }
    }
}

fn spawn_all(tracker: &TaskTracker, message: &PubSubMessage, handlers: &Handlers) {
    for (id, handler) in handlers.iter() {
        let (id, handler, message) = (*id, Arc::clone(handler), message.clone());
        tracker.spawn(async move { invoke(id, &handler, message).await });
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    queued: Arc<AtomicUsize>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            job = rx.recv() => job,
        };
        let Some(job) = job else { break };
        if job.ordered {
            for (id, handler) in job.handlers.iter() {
                invoke(*id, handler, job.message.clone()).await;
            }
        } else {
            spawn_all(&tracker, &job.message, &job.handlers);
        }
        queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run one handler, containing any panic it raises.
async fn invoke(id: SubscriptionId, handler: &super::Handler, message: PubSubMessage) {
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
        Err(panic) => Err(panic),
    };
    if let Err(panic) = outcome {
        tracing::error!(
            subscription = %id,
            panic = %panic_message(&*panic),
            "subscription handler panicked"
        );
    }
}
