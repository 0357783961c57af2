
//! Fan-out of round events to connected clients and internal processes.
//!
//! Delivery is best-effort with a bounded per-subscriber buffer; slow
//! subscribers drop their oldest events. New subscribers receive the
//! last event first so clients joining mid-round can catch up.

use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use ark::RoundEvent;

/// Capacity of each subscriber's event buffer.
const SUBSCRIBER_BUFFER: usize = 256;

/// Stream of round events for one subscriber.
pub struct EventStream {
	first: Option<Arc<RoundEvent>>,
	events: BroadcastStream<Arc<RoundEvent>>,
}

impl Stream for EventStream {
	type Item = Arc<RoundEvent>;

	fn poll_next(
		mut self: Pin<&mut Self>,
		cx: &mut std::task::Context,
	) -> Poll<Option<Self::Item>> {
		if let Some(e) = self.first.take() {
			return Poll::Ready(Some(e));
		}
		loop {
			match Pin::new(&mut self.events).poll_next(cx) {
				// we lagged behind, continuing gives us newer events
				Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
				Poll::Ready(Some(Ok(e))) => break Poll::Ready(Some(e)),
				Poll::Ready(None) => break Poll::Ready(None),
				Poll::Pending => break Poll::Pending,
			}
		}
	}
}

/// The event bus.
///
/// The ledger publishes mint events and the round coordinator publishes
/// phase events; the sweeper and clients subscribe. Neither side holds a
/// reference to the other.
pub struct EventBus {
	tx: broadcast::Sender<Arc<RoundEvent>>,
	last: parking_lot::Mutex<Option<Arc<RoundEvent>>>,
}

impl EventBus {
	pub fn new() -> EventBus {
		let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
		EventBus {
			tx,
			last: parking_lot::Mutex::new(None),
		}
	}

	/// Broadcast a new event and store it as the last sent event.
	pub fn publish(&self, event: RoundEvent) {
		let event = Arc::new(event);
		let mut last_lock = self.last.lock();
		// an error only means there are no subscribers right now
		let _ = self.tx.send(event.clone());
		*last_lock = Some(event);
	}

	/// Subscribe to events, replaying the last event first (if any).
	pub fn subscribe(&self) -> EventStream {
		let first = self.last.lock().clone();
		let events = BroadcastStream::new(self.tx.subscribe());
		EventStream { first, events }
	}

	/// Subscribe without replay.
	pub fn subscribe_fresh(&self) -> EventStream {
		EventStream {
			first: None,
			events: BroadcastStream::new(self.tx.subscribe()),
		}
	}

	/// Clear the last round event.
	///
	/// Called when an empty round finishes to prevent replaying stale
	/// events to new subscribers.
	pub fn clear_last(&self) {
		*self.last.lock() = None;
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use ark::rounds::RoundSeq;
	use tokio_stream::StreamExt;

	#[tokio::test]
	async fn replay_last_event_to_new_subscribers() {
		let bus = EventBus::new();
		bus.publish(RoundEvent::Started { round_seq: RoundSeq::new(1) });

		let mut sub = bus.subscribe();
		let event = sub.next().await.unwrap();
		assert!(matches!(*event, RoundEvent::Started { .. }));

		bus.clear_last();
		let mut sub = bus.subscribe_fresh();
		bus.publish(RoundEvent::Failed {
			round_seq: RoundSeq::new(1),
			reason: "test".into(),
		});
		let event = sub.next().await.unwrap();
		assert!(matches!(*event, RoundEvent::Failed { .. }));
	}

	#[tokio::test]
	async fn overflow_drops_oldest() {
		let bus = EventBus::new();
		let mut sub = bus.subscribe_fresh();
		for i in 0..(SUBSCRIBER_BUFFER + 10) {
			bus.publish(RoundEvent::Started { round_seq: RoundSeq::new(i as u64) });
		}
		// the subscriber lags, but keeps receiving newer events
		let event = sub.next().await.unwrap();
		if let RoundEvent::Started { round_seq } = *event {
			assert!(round_seq.inner() >= 10);
		} else {
			panic!("unexpected event");
		}
	}
}
