//! The node's single sequential dispatch loop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{EventArgs, NodeInner, Request};
use crate::service::panic_message;

/// Consume events and requests until the node is cancelled or both queues
/// close. Handlers run one at a time; when both queues are ready the pick is
/// unordered.
pub(super) async fn run(
    inner: Arc<NodeInner>,
    mut events: mpsc::Receiver<EventArgs>,
    mut requests: mpsc::Receiver<Request>,
) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            Some(args) = events.recv() => dispatch_event(&inner, args).await,
            Some(request) = requests.recv() => dispatch_request(&inner, request).await,
            else => break,
        }
    }

    debug!(nid = %inner.config.id, "Dispatch loop exiting");
}

pub(super) async fn dispatch_request(inner: &NodeInner, request: Request) {
    let route = request.route();
    let handler = {
        let handlers = inner.handlers.read().await;
        handlers
            .routes
            .get(&route)
            .map(|entry| Arc::clone(&entry.handler))
            .or_else(|| handlers.default.clone())
    };

    let Some(handler) = handler else {
        warn!(route, cid = request.cid(), "Message routing does not register handler function");
        return;
    };

    if let Some(panic) = recover(async move { handler(request).await }).await {
        error!(route, panic = %panic, "Route handler panicked");
    }
}

async fn dispatch_event(inner: &NodeInner, args: EventArgs) {
    let event = args.event;
    let handler = inner.handlers.read().await.events.get(&event).cloned();

    let Some(handler) = handler else {
        warn!(event = %event, gid = %args.gid, "Event does not register handler function");
        return;
    };

    if let Some(panic) = recover(async move { handler(args).await }).await {
        error!(event = %event, panic = %panic, "Event handler panicked");
    }
}

/// Run `fut`, returning the panic message if it panicked. Callers wrap the
/// handler call itself in `fut` so a panic raised before the handler yields
/// its future is caught as well.
async fn recover<F: Future<Output = ()>>(fut: F) -> Option<String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .err()
        .map(|panic| panic_message(panic.as_ref()))
}
