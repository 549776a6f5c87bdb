use tokio::sync::broadcast;

/// Progress notifications emitted during sync. Fire-and-forget: publishing
/// never fails and never blocks, subscribers that lag simply miss events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
	BeforeDownloadRef(String),
	BeforeDownloadIndex(String),
	BeforeDownloadFiles(usize),
	BeforeDownloadFile { seq: usize, total: usize },
	BeforeDownloadChunks(usize),
	BeforeDownloadChunk { seq: usize, total: usize },
	BeforeUploadIndex(String),
	BeforeUploadIndexes,
	BeforeUploadRef(String),
	BeforeUploadFiles(usize),
	BeforeUploadFile { seq: usize, total: usize },
	BeforeUploadChunks(usize),
	BeforeUploadChunk { seq: usize, total: usize },
	BeforeUploadCheckIndex,
	BeforeFixObjects { seq: usize, total: usize },
	AfterFixObjects,
	CloudCorrupted,
}

#[derive(Debug, Clone)]
pub struct EventBus {
	tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self { tx }
	}

	pub fn publish(&self, event: SyncEvent) {
		// A send only errors when there are no subscribers, which is fine.
		let _ = self.tx.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.tx.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(256)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_publish_without_subscribers_is_fine() {
		let bus = EventBus::default();
		bus.publish(SyncEvent::CloudCorrupted);
	}

	#[tokio::test]
	async fn test_subscriber_receives_events() {
		let bus = EventBus::default();
		let mut rx = bus.subscribe();
		bus.publish(SyncEvent::BeforeUploadIndexes);
		assert_eq!(rx.recv().await.unwrap(), SyncEvent::BeforeUploadIndexes);
	}
}
