use std::sync::Arc;

use serde_json::Value;

use crate::{
    gate::GateGuard,
    payload::{self, DeliveredNotification},
    store::NotificationStore,
};

/// The push provider SDK as seen from the store side.
pub trait PushProvider: Send + Sync {
    fn set_apns_token(&self, token: &[u8]);
    fn subscribe_to_channels(&self, channels: &[String]);
}

/// How a notification arriving in the foreground should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationOptions {
    pub alert: bool,
    pub badge: bool,
    pub sound: bool,
}

impl PresentationOptions {
    pub const ALL: PresentationOptions = PresentationOptions {
        alert: true,
        badge: true,
        sound: true,
    };
}

/// An in-flight fetch from the platform notification center. Holding it keeps
/// the store gate entered until the fetch is completed or abandoned.
#[derive(Debug)]
#[must_use = "dropping the ticket abandons the fetch"]
pub struct FetchTicket {
    _guard: GateGuard,
}

/// Callbacks the platform and the push SDK deliver to the application.
pub trait PushDelegate {
    /// Raw APNs device token from a successful remote registration.
    fn on_token_received(&self, token: &[u8]);

    /// Remote registration failed; the reason is informational only.
    fn on_registration_failed(&self, reason: &str);

    /// Registration token issued by the push provider.
    fn on_registration_token(&self, token: &str);

    /// Data-only message from the push provider.
    fn on_message_received(&self, data: &Value);

    /// A notification arrived while the app is in the foreground.
    fn on_notification_presented(&self, notification: &DeliveredNotification) -> PresentationOptions;

    /// The user opened a notification.
    fn on_notification_tapped(&self, notification: &DeliveredNotification);

    /// The app came to the foreground and is about to ask the notification
    /// center for everything it still shows.
    fn begin_center_fetch(&self) -> FetchTicket;

    fn complete_center_fetch(&self, ticket: FetchTicket, delivered: Vec<DeliveredNotification>);
}

/// Default delegate: feeds platform callbacks into a [`NotificationStore`].
pub struct PushHandler {
    store: Arc<NotificationStore>,
    provider: Arc<dyn PushProvider>,
    channels: Vec<String>,
}

impl PushHandler {
    pub fn new(
        store: Arc<NotificationStore>,
        provider: Arc<dyn PushProvider>,
        channels: Vec<String>,
    ) -> Self {
        Self {
            store,
            provider,
            channels,
        }
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    fn log_payload(notification: &DeliveredNotification) {
        if let Some(id) = payload::message_id(&notification.user_info) {
            tracing::debug!(message_id = id, "push message");
        }
        tracing::trace!(user_info = %notification.user_info, "notification payload");
    }
}

impl PushDelegate for PushHandler {
    fn on_token_received(&self, token: &[u8]) {
        let formatted = payload::apns_token_string(token);
        tracing::info!(token = %formatted, "registered for remote notifications");
        self.store.set_token(Some(formatted));
        self.provider.set_apns_token(token);
        let _guard = self.store.gate().enter();
        self.provider.subscribe_to_channels(&self.channels);
    }

    fn on_registration_failed(&self, reason: &str) {
        tracing::warn!(reason, "remote notification registration failed");
        self.store.set_token(None);
    }

    fn on_registration_token(&self, token: &str) {
        tracing::info!(token, "push registration token received");
        self.store.set_fcm_token(Some(token.to_string()));
    }

    fn on_message_received(&self, data: &Value) {
        tracing::debug!(%data, "received data message");
    }

    fn on_notification_presented(&self, notification: &DeliveredNotification) -> PresentationOptions {
        Self::log_payload(notification);
        let record = payload::record_from_delivered(notification, false, self.store.tags());
        self.store.insert(vec![record], false);
        PresentationOptions::ALL
    }

    fn on_notification_tapped(&self, notification: &DeliveredNotification) {
        Self::log_payload(notification);
        let record = payload::record_from_delivered(notification, true, self.store.tags());
        self.store.insert(vec![record], true);
    }

    fn begin_center_fetch(&self) -> FetchTicket {
        FetchTicket {
            _guard: self.store.gate().enter(),
        }
    }

    fn complete_center_fetch(&self, ticket: FetchTicket, delivered: Vec<DeliveredNotification>) {
        let tags = self.store.tags();
        let records = delivered
            .iter()
            .map(|notification| payload::record_from_delivered(notification, false, tags.clone()))
            .collect::<Vec<_>>();
        tracing::debug!(count = records.len(), "fetched delivered notifications");
        self.store.insert(records, false);
        drop(ticket);
    }
}
