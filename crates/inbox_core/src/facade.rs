//! Traits application code composes against instead of touching the store directly.

use std::sync::{Arc, Weak};

use crate::{
    events::{EventBus, EventKind, StoreEvent, SubscriptionId},
    record::NotificationRecord,
    store::NotificationStore,
};

/// Read projections and pass-through mutations over a [`NotificationStore`].
pub trait Storage {
    fn notification_store(&self) -> &NotificationStore;

    fn apns_token(&self) -> Option<String> {
        self.notification_store().token()
    }

    fn fcm_token(&self) -> Option<String> {
        self.notification_store().fcm_token()
    }

    fn notifications(&self) -> Vec<NotificationRecord> {
        self.notification_store().records()
    }

    fn read_notifications(&self) -> Vec<NotificationRecord> {
        only_read(self.notifications(), true)
    }

    fn unread_notifications(&self) -> Vec<NotificationRecord> {
        only_read(self.notifications(), false)
    }

    fn all_count(&self) -> usize {
        self.notification_store().len()
    }

    fn read_count(&self) -> usize {
        self.read_notifications().len()
    }

    fn unread_count(&self) -> usize {
        self.unread_notifications().len()
    }

    fn notifications_tagged<S: AsRef<str>>(
        &self,
        tags: Option<&[S]>,
        need_untagged: bool,
    ) -> Vec<NotificationRecord> {
        self.notification_store().search(tags, need_untagged)
    }

    fn read_notifications_tagged<S: AsRef<str>>(
        &self,
        tags: Option<&[S]>,
        need_untagged: bool,
    ) -> Vec<NotificationRecord> {
        only_read(self.notifications_tagged(tags, need_untagged), true)
    }

    fn unread_notifications_tagged<S: AsRef<str>>(
        &self,
        tags: Option<&[S]>,
        need_untagged: bool,
    ) -> Vec<NotificationRecord> {
        only_read(self.notifications_tagged(tags, need_untagged), false)
    }

    fn all_count_tagged<S: AsRef<str>>(&self, tags: Option<&[S]>, need_untagged: bool) -> usize {
        self.notifications_tagged(tags, need_untagged).len()
    }

    fn read_count_tagged<S: AsRef<str>>(&self, tags: Option<&[S]>, need_untagged: bool) -> usize {
        self.read_notifications_tagged(tags, need_untagged).len()
    }

    fn unread_count_tagged<S: AsRef<str>>(&self, tags: Option<&[S]>, need_untagged: bool) -> usize {
        self.unread_notifications_tagged(tags, need_untagged).len()
    }

    fn clear(&self, notify: bool) {
        self.notification_store().clear(notify);
    }

    fn update_read_state(&self, id: &str, is_read: bool, notify: bool) {
        self.notification_store().update_read_state(id, is_read, notify);
    }

    fn update(&self, record: NotificationRecord, notify: bool) {
        self.notification_store().update(record, notify);
    }

    fn remove_by_tags<S: AsRef<str>>(&self, tags: Option<&[S]>) -> Vec<NotificationRecord> {
        self.notification_store().remove_by_tags(tags, true)
    }

    fn add_tags<S: AsRef<str>>(&self, tags: &[S]) {
        self.notification_store().add_tags(tags);
    }

    fn remove_tags<S: AsRef<str>>(&self, tags: &[S]) {
        self.notification_store().remove_tags(tags);
    }

    fn clear_tags(&self) {
        self.notification_store().clear_tags();
    }
}

impl Storage for NotificationStore {
    fn notification_store(&self) -> &NotificationStore {
        self
    }
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn notification_store(&self) -> &NotificationStore {
        (**self).notification_store()
    }
}

fn only_read(records: Vec<NotificationRecord>, is_read: bool) -> Vec<NotificationRecord> {
    records
        .into_iter()
        .filter(|record| record.is_read == is_read)
        .collect()
}

/// Observer of store events.
pub trait Notificator: Send + Sync + 'static {
    fn on_update(&self);

    /// Use [`Notificator::unpack`] to get at the record.
    fn on_record_received(&self, event: &StoreEvent);

    /// Use [`Notificator::unpack`] to get at the record.
    fn on_record_read(&self, event: &StoreEvent);

    /// Registers `observer` for all three event kinds. The bus only keeps a
    /// weak reference; the returned [`Subscription`] must be kept for as long
    /// as events are wanted.
    fn subscribe(observer: &Arc<Self>, bus: &EventBus) -> Subscription
    where
        Self: Sized,
    {
        let ids = EventKind::ALL
            .iter()
            .map(|&kind| {
                let weak: Weak<Self> = Arc::downgrade(observer);
                bus.subscribe(kind, move |event| {
                    let Some(observer) = weak.upgrade() else {
                        return;
                    };
                    match event {
                        StoreEvent::Update => observer.on_update(),
                        StoreEvent::RecordReceived(_) => observer.on_record_received(event),
                        StoreEvent::RecordRead(_) => observer.on_record_read(event),
                    }
                })
            })
            .collect();
        Subscription {
            bus: bus.clone(),
            ids,
        }
    }

    fn unpack(event: &StoreEvent) -> Option<&NotificationRecord>
    where
        Self: Sized,
    {
        event.record()
    }
}

/// Registration of one observer on every event kind. Dropping it unsubscribes.
#[derive(Debug)]
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    bus: EventBus,
    ids: Vec<SubscriptionId>,
}

impl Subscription {
    pub fn ids(&self) -> &[SubscriptionId] {
        &self.ids
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let ids = std::mem::take(&mut self.ids);
        let removed = self.bus.unsubscribe_all(&ids);
        tracing::trace!(removed, "observer unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.ids.is_empty() {
            self.release();
        }
    }
}
