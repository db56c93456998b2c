/// Event bus using tokio broadcast channel.
/// All subscribers receive all published values.
pub struct EventBus<T: Clone> {
    tx: tokio::sync::broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, value: T) {
        // Ignore error if no receivers
        let _ = self.tx.send(value);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_all() {
        let bus: EventBus<u32> = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(1);
        bus.publish(2);

        assert_eq!(rx1.recv().await.unwrap(), 1);
        assert_eq!(rx1.recv().await.unwrap(), 2);
        assert_eq!(rx2.recv().await.unwrap(), 1);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus: EventBus<String> = EventBus::default();
        bus.publish("dropped".to_string());
        assert_eq!(bus.receiver_count(), 0);
    }
}
