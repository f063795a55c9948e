#![forbid(unsafe_code)]

//! Fan-out of progress events to every subscriber of a download key.

use std::collections::HashMap;

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::progress::ProgressEvent;

/// Receiving half handed to one subscriber.
///
/// The stream ends after a terminal event, or right away if the download
/// finished before the subscriber attached and nothing was preloaded.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl Subscription {
    /// A subscription that yields exactly `events` and then ends.
    pub fn preloaded(events: impl IntoIterator<Item = ProgressEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            let _ = tx.send(event);
        }
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures_util::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}

#[derive(Debug, Default)]
pub struct ProgressBroadcaster {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ProgressEvent>>>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber. `snapshot`, if any, is delivered before any
    /// event published afterwards.
    pub fn subscribe(&self, key: &str, snapshot: Option<ProgressEvent>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(event) = snapshot {
            let _ = tx.send(event);
        }
        self.subscribers
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(tx);
        Subscription { rx }
    }

    /// Delivers `event` to every live subscriber of `key`. Subscribers that
    /// went away are dropped. A terminal event closes every subscription of
    /// the key.
    pub fn publish(&self, key: &str, event: ProgressEvent) {
        let mut subscribers = self.subscribers.lock();
        let terminal = event.phase.is_terminal();

        let Some(senders) = subscribers.get_mut(key) else {
            return;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());

        if terminal || senders.is_empty() {
            // Dropping the senders ends every receiver after the last event.
            subscribers.remove(key);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers
            .lock()
            .get(key)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}
