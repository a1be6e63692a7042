//! Background credit issuance, decoupled from the request/response path.
//!
//! Grounded on the teacher's `SigDown`/`CancellationToken`-driven graceful shutdown
//! in `src/main.rs`: that pattern hands a `tokio_util::sync::CancellationToken` to a
//! long-lived task and lets it drain before exit. Here the same token shape guards a
//! single background worker that issues compensating credits after a backend
//! failure, so the client-facing response is never held up waiting on a KV store
//! round trip for the credit write (spec §4.5, §8 scenario 5).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::Pipeline;
use crate::route::RouteDescriptor;

struct CreditEvent {
    route: RouteDescriptor,
    payer: String,
    backend_status: u16,
}

#[derive(Clone)]
pub struct CreditTaskHandle {
    sender: mpsc::Sender<CreditEvent>,
}

impl CreditTaskHandle {
    /// Enqueues a backend outcome for credit evaluation. Never blocks the caller on
    /// the KV store: if the queue is full, the event is dropped and logged, trading
    /// one missed compensating credit for response latency (REDESIGN FLAGS).
    pub fn record_backend_outcome(&self, route: RouteDescriptor, payer: String, backend_status: u16) {
        let event = CreditEvent {
            route,
            payer,
            backend_status,
        };
        if let Err(err) = self.sender.try_send(event) {
            tracing::warn!(error = %err, "credit task queue full, dropping compensating-credit check");
        }
    }
}

/// Spawns the background worker and returns a cheap-to-clone handle to it. The
/// worker exits once `shutdown` is cancelled and the channel drains.
pub fn spawn(pipeline: Arc<Pipeline>, shutdown: CancellationToken) -> CreditTaskHandle {
    let (sender, mut receiver) = mpsc::channel::<CreditEvent>(1024);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    receiver.close();
                    while let Some(event) = receiver.recv().await {
                        pipeline
                            .record_backend_outcome(&event.route, &event.payer, event.backend_status)
                            .await;
                    }
                    break;
                }
                event = receiver.recv() => {
                    match event {
                        Some(event) => {
                            pipeline
                                .record_backend_outcome(&event.route, &event.payer, event.backend_status)
                                .await;
                        }
                        None => break,
                    }
                }
            }
        }
    });
    CreditTaskHandle { sender }
}
