//! 变更广播

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::events::{ChangeEvent, Collection, Notification, PageEvent};

/// 事件发布接口
///
/// 发布失败不会影响产生事件的命令。
pub trait EventSink: Send + Sync {
    fn publish_change(&self, event: ChangeEvent);

    fn publish_page(&self, event: PageEvent);
}

/// 通知器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifierConfig {
    /// 每个订阅者可缓存的事件数，超出后收到 Resync
    pub channel_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// 变更通知器
#[derive(Debug)]
pub struct ChangeNotifier {
    changes: broadcast::Sender<ChangeEvent>,
    pages: broadcast::Sender<PageEvent>,
    published: AtomicU64,
}

impl ChangeNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (changes, _) = broadcast::channel(capacity);
        let (pages, _) = broadcast::channel(capacity);
        Self {
            changes,
            pages,
            published: AtomicU64::new(0),
        }
    }

    /// 订阅指定集合
    pub fn subscribe(&self, collections: &[Collection]) -> Subscription {
        Subscription {
            receiver: self.changes.subscribe(),
            collections: collections.iter().copied().collect(),
        }
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(&Collection::ALL)
    }

    pub fn subscribe_pages(&self) -> PageSubscription {
        PageSubscription {
            receiver: self.pages.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    /// 已发布的变更事件总数
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(NotifierConfig::default())
    }
}

impl EventSink for ChangeNotifier {
    fn publish_change(&self, event: ChangeEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let collection = event.collection;
        match self.changes.send(event) {
            Ok(receivers) => debug!("Published {} change to {} subscribers", collection.as_str(), receivers),
            Err(_) => debug!("No subscribers for {} change", collection.as_str()),
        }
    }

    fn publish_page(&self, event: PageEvent) {
        let encounter_id = event.encounter_id;
        if self.pages.send(event).is_err() {
            debug!("No page subscribers for encounter {}", encounter_id);
        }
    }
}

/// 变更订阅
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<ChangeEvent>,
    collections: HashSet<Collection>,
}

impl Subscription {
    pub fn collections(&self) -> &HashSet<Collection> {
        &self.collections
    }

    /// 等待下一个关注集合的通知；通知器关闭后返回 None
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.collections.contains(&event.collection) {
                        return Some(Notification::Change(event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged behind by {} events, requesting resync", skipped);
                    return Some(Notification::Resync);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞读取，当前无通知时返回 None
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.collections.contains(&event.collection) {
                        return Some(Notification::Change(event));
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged behind by {} events, requesting resync", skipped);
                    return Some(Notification::Resync);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// 叫号订阅
#[derive(Debug)]
pub struct PageSubscription {
    receiver: broadcast::Receiver<PageEvent>,
}

impl PageSubscription {
    /// 叫号只用于呈现，落后时直接跳过丢失的事件
    pub async fn recv(&mut self) -> Option<PageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Page subscriber skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<PageEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Page subscriber skipped {} events", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeKind;
    use attendance_core::StationId;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscription_filters_collections() {
        let notifier = ChangeNotifier::default();
        let mut checklist_only = notifier.subscribe(&[Collection::ChecklistItems]);

        let encounter_id = Uuid::new_v4();
        notifier.publish_change(ChangeEvent::encounter(ChangeKind::Updated, encounter_id));
        let item_id = Uuid::new_v4();
        notifier.publish_change(ChangeEvent::new(
            Collection::ChecklistItems,
            ChangeKind::Created,
            item_id,
            encounter_id,
        ));

        match checklist_only.recv().await {
            Some(Notification::Change(event)) => assert_eq!(event.entity_id, item_id),
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(checklist_only.try_recv().is_none());
        assert_eq!(notifier.published_count(), 2);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_resync() {
        let notifier = ChangeNotifier::new(NotifierConfig { channel_capacity: 2 });
        let mut subscription = notifier.subscribe_all();

        for _ in 0..5 {
            notifier.publish_change(ChangeEvent::encounter(ChangeKind::Updated, Uuid::new_v4()));
        }

        assert_eq!(subscription.recv().await, Some(Notification::Resync));
        assert!(matches!(subscription.recv().await, Some(Notification::Change(_))));
    }

    #[test]
    fn test_publish_without_subscribers_does_not_fail() {
        let notifier = ChangeNotifier::default();
        notifier.publish_change(ChangeEvent::encounter(ChangeKind::Created, Uuid::new_v4()));
        notifier.publish_page(PageEvent {
            id: Uuid::new_v4(),
            encounter_id: Uuid::new_v4(),
            patient_display_name: "Ana".into(),
            destination_label: "Triage 1".into(),
            station_id: StationId::new("triage-1"),
            call_count: 1,
            recall: false,
            at: Utc::now(),
        });
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_collection_names() {
        for collection in Collection::ALL {
            assert_eq!(Collection::try_from(collection.as_str()).unwrap(), collection);
        }
    }
}
