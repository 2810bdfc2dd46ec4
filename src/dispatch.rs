//! Single-consumer event delivery.
//!
//! Producers on any task push into a lock-free FIFO queue and the one
//! consumer drains it in order. Events are never reordered or coalesced.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use tokio::{sync::Notify, time};

use crate::event::{EventBus, SerialEvent};

/// Interval at which an idle consumer re-checks whether producers are gone
const PRODUCER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct EventDispatcher {
   queue: SegQueue<SerialEvent>,
   notifier: Notify,
}

impl EventDispatcher {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   /// Waits for the next event.
   ///
   /// Returns `None` once the queue is drained and every producer handle
   /// has been dropped.
   pub async fn recv(self: &Arc<Self>) -> Option<SerialEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(PRODUCER_CHECK_INTERVAL, notify).await;
      }
   }

   /// Takes every queued event without waiting.
   pub fn drain(&self) -> Vec<SerialEvent> {
      let mut events = Vec::with_capacity(self.queue.len());
      while let Some(event) = self.queue.pop() {
         events.push(event);
      }
      events
   }
}

impl EventBus for EventDispatcher {
   fn emit(&self, event: SerialEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
