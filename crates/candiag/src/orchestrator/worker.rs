//! Single worker that owns the UDS client
//!
//! One request is in flight at a time. The worker drains the submission
//! channel into its local priority heap, dispatches the head, emits the
//! outcome and runs the request's callback on this task.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::connection::{Flow, Shared};
use super::events::DiagEvent;
use super::queue::{QueuedRequest, Request, RequestId, RequestQueue};
use crate::error::DiagError;
use crate::uds::{service_id, UdsClient, UdsError};

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    token: CancellationToken,
) {
    let mut queue = RequestQueue::default();
    debug!("Request worker started");

    loop {
        while let Ok(item) = rx.try_recv() {
            queue.push(item);
        }

        let item = match queue.pop() {
            Some(item) => item,
            None => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = tokio::time::timeout(shared.options.poll_interval, rx.recv()) => {
                        match received {
                            Ok(Some(item)) => queue.push(item),
                            Ok(None) => break,
                            // Idle poll tick
                            Err(_) => {}
                        }
                    }
                }
                continue;
            }
        };

        if token.is_cancelled() {
            break;
        }
        if !shared.take_pending(item.id) {
            debug!(request_id = item.id, "Skipping invalidated request");
            continue;
        }
        if dispatch(&shared, item, &token).await == Flow::Stop {
            break;
        }
    }

    debug!(remaining = queue.len(), "Request worker stopped");
}

async fn dispatch(shared: &Arc<Shared>, item: QueuedRequest, token: &CancellationToken) -> Flow {
    let profile = shared.profile();
    let timeout = item.request.timeout.unwrap_or(profile.request_timeout);
    if item.is_stale(timeout, Instant::now()) {
        debug!(
            request_id = item.id,
            service = item.request.service,
            "Dropping request that expired in the queue"
        );
        return Flow::Continue;
    }

    let QueuedRequest { id, request, .. } = item;
    let Some(client) = shared.client() else {
        deliver_failure(shared, id, request, DiagError::NotConnected);
        return Flow::Continue;
    };

    // Session changes may have replaced the profile since the last request
    client.apply_timeouts(&profile);
    debug!(
        request_id = id,
        service = request.service,
        data = %hex::encode(&request.payload),
        "Dispatching request"
    );

    let exchange = call(client.as_ref(), &request.payload, request.expect_response);
    let result = match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(UdsError::Timeout),
    };

    if token.is_cancelled() {
        debug!(request_id = id, "Discarding result after disconnect");
        return Flow::Stop;
    }

    match result {
        Ok(response) => {
            deliver_success(shared, id, request, response);
            Flow::Continue
        }
        Err(e) => handle_failure(shared, id, request, DiagError::from(e), token).await,
    }
}

// Request callbacks are not `Sync`; only the payload may be borrowed across the await
async fn call(
    client: &dyn UdsClient,
    payload: &[u8],
    expect_response: bool,
) -> Result<Vec<u8>, UdsError> {
    if expect_response {
        client.request(payload).await
    } else {
        client.send_only(payload).await.map(|()| Vec::new())
    }
}

fn deliver_success(shared: &Shared, id: RequestId, request: Request, response: Vec<u8>) {
    trace!(request_id = id, data = %hex::encode(&response), "Response");
    if !request.keepalive {
        shared.emit(DiagEvent::ResponseReceived {
            id,
            service: request.service,
            success: true,
            data: response.clone(),
            nrc: None,
        });
    }

    let Some(on_success) = request.on_success else {
        return;
    };
    match catch_unwind(AssertUnwindSafe(move || on_success(response))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => shared.report(&e),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(request_id = id, service = request.service, %message, "Success callback panicked");
            shared.report(&DiagError::Callback(message));
        }
    }
}

async fn handle_failure(
    shared: &Arc<Shared>,
    id: RequestId,
    request: Request,
    err: DiagError,
    token: &CancellationToken,
) -> Flow {
    if request.keepalive && !err.is_fatal() {
        debug!(request_id = id, error = %err, "Tester present failed");
        return Flow::Continue;
    }

    let flow = if err.is_fatal() {
        shared.recover(token, &err).await
    } else {
        match &err {
            DiagError::Uds(UdsError::Timeout | UdsError::IsoTp(_) | UdsError::Closed) => {
                shared.recycle(token).await
            }
            _ => Flow::Continue,
        }
    };

    if !request.keepalive {
        deliver_failure(shared, id, request, err);
    }
    flow
}

fn deliver_failure(shared: &Shared, id: RequestId, request: Request, err: DiagError) {
    let data = match &err {
        DiagError::Uds(UdsError::NegativeResponse { service_id: sid, nrc }) => {
            vec![service_id::NEGATIVE_RESPONSE, *sid, nrc.code()]
        }
        _ => Vec::new(),
    };
    shared.emit(DiagEvent::ResponseReceived {
        id,
        service: request.service,
        success: false,
        data,
        nrc: err.nrc(),
    });

    let Some(on_failure) = request.on_failure else {
        shared.report(&err);
        return;
    };
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_failure(&err))) {
        let message = panic_message(panic.as_ref());
        error!(request_id = id, service = request.service, %message, "Failure callback panicked");
        shared.report(&DiagError::Callback(message));
    } else {
        warn!(request_id = id, service = request.service, error = %err, "Request failed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}
