/// Bounded impression write buffer
///
/// Producers are request handlers; consumers are the background flushers.
/// Overflow drops the oldest entries and counts the drops, so a slow
/// database never delays a recommendation response.
use crate::db::models::Impression;
use crate::metrics;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct ImpressionBuffer {
    queue: Mutex<VecDeque<Impression>>,
    notify: Notify,
    capacity: usize,
}

impl ImpressionBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a batch, dropping the oldest entries on overflow.
    pub fn push_batch(&self, impressions: Vec<Impression>) {
        let mut queue = self.queue.lock().unwrap();
        for impression in impressions {
            if queue.len() >= self.capacity {
                queue.pop_front();
                metrics::IMPRESSION_BUFFER_DROPPED_TOTAL.inc();
            }
            queue.push_back(impression);
        }
        metrics::IMPRESSION_BUFFER_DEPTH.set(queue.len() as i64);
        drop(queue);
        self.notify.notify_one();
    }

    /// Take up to `max` entries for persistence.
    pub fn drain(&self, max: usize) -> Vec<Impression> {
        let mut queue = self.queue.lock().unwrap();
        let take = queue.len().min(max);
        let drained: Vec<Impression> = queue.drain(..take).collect();
        metrics::IMPRESSION_BUFFER_DEPTH.set(queue.len() as i64);
        drained
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until new entries arrive.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn impression(n: u128) -> Impression {
        Impression {
            id: Uuid::from_u128(n),
            user_id: Uuid::from_u128(1),
            track_id: Uuid::from_u128(n),
            recommendation_id: Uuid::from_u128(2),
            model_type: "cf".into(),
            model_version: None,
            score: 0.5,
            position: n as i64,
            context: None,
            shown_at: Utc::now(),
            clicked: false,
            played: false,
            liked: false,
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let buffer = ImpressionBuffer::new(3);
        buffer.push_batch(vec![impression(1), impression(2), impression(3), impression(4)]);

        assert_eq!(buffer.len(), 3);
        let drained = buffer.drain(10);
        let ids: Vec<_> = drained.iter().map(|i| i.id).collect();
        assert_eq!(
            ids,
            vec![Uuid::from_u128(2), Uuid::from_u128(3), Uuid::from_u128(4)]
        );
    }

    #[test]
    fn drain_respects_max() {
        let buffer = ImpressionBuffer::new(10);
        buffer.push_batch((1..=5).map(impression).collect());

        assert_eq!(buffer.drain(2).len(), 2);
        assert_eq!(buffer.len(), 3);
    }
}
