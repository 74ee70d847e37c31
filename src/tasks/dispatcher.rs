//! Hands finished loads back to the display context.
//!
//! Workers push deliveries into a channel; the consumer drives a [`DeliveryPump`] on the
//! thread that owns its views. The pump applies the staleness check right before touching
//! the view, so "last request wins" per target whatever order loads complete in.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::events::{DecodedImage, LoadOutcome, RequestKey};
use crate::target::TargetHandle;

/// One result on its way to one target.
pub(crate) struct Delivery {
    pub(crate) key: RequestKey,
    pub(crate) target: TargetHandle,
    pub(crate) image: Option<DecodedImage>,
    pub(crate) completions: Vec<oneshot::Sender<LoadOutcome>>,
}

/// Create a connected dispatcher / pump pair.
pub fn channel() -> (Dispatcher, DeliveryPump) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Dispatcher { tx }, DeliveryPump { rx })
}

/// Sending half, shared by the request path and every worker.
#[derive(Clone)]
pub struct Dispatcher {
    tx: Sender<Delivery>,
}

impl Dispatcher {
    /// Fire and forget.
    pub(crate) fn deliver(&self, delivery: Delivery) {
        if let Err(err) = self.tx.send(delivery) {
            debug!(key = %err.0.key, "delivery pump is gone; dropping result");
        }
    }
}

/// Receiving half, owned by the display thread.
pub struct DeliveryPump {
    rx: Receiver<Delivery>,
}

impl DeliveryPump {
    /// Apply everything already waiting without blocking; suited to a frame loop.
    pub fn drain(&self) -> usize {
        let mut applied = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            apply(delivery);
            applied += 1;
        }
        applied
    }

    /// Wait up to `timeout` for one delivery and apply it.
    pub fn next_timeout(&self, timeout: Duration) -> Option<(RequestKey, LoadOutcome)> {
        match self.rx.recv_timeout(timeout) {
            Ok(delivery) => {
                let key = delivery.key.clone();
                Some((key, apply(delivery)))
            }
            Err(_) => None,
        }
    }

    /// Apply deliveries until the loader and all its workers are gone.
    pub fn run(self) {
        for delivery in self.rx.iter() {
            apply(delivery);
        }
        debug!("delivery pump finished");
    }
}

fn apply(delivery: Delivery) -> LoadOutcome {
    let Delivery {
        key,
        target,
        image,
        completions,
    } = delivery;

    let outcome = if !target.is_expecting(&key) {
        trace!(%key, target = target.id(), "dropping stale result");
        LoadOutcome::Stale
    } else {
        target.show(image.as_ref());
        match image {
            Some(image) => LoadOutcome::Shown(image),
            None => LoadOutcome::Cleared,
        }
    };

    for completion in completions {
        let _ = completion.send(outcome.clone());
    }
    outcome
}

/// Resolves once a request's result reached the display context (applied or dropped).
///
/// Awaiting is optional; dropping a `Completion` does not affect the load.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<LoadOutcome>,
}

impl Completion {
    pub(crate) fn channel() -> (oneshot::Sender<LoadOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Block the current (non-async) thread until the outcome is known.
    pub fn blocking_wait(self) -> LoadOutcome {
        self.rx.blocking_recv().unwrap_or(LoadOutcome::Abandoned)
    }
}

impl Future for Completion {
    type Output = LoadOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(LoadOutcome::Abandoned))
    }
}
