use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::NotificationRecord;

/// Key the push provider uses for its message id inside the user info.
pub const MESSAGE_ID_KEY: &str = "gcm.message_id";

/// A notification as handed over by the platform notification center.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveredNotification {
    pub identifier: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub user_info: Value,
}

impl DeliveredNotification {
    pub fn new(identifier: impl Into<String>, date: DateTime<Utc>, user_info: Value) -> Self {
        Self {
            identifier: identifier.into(),
            date,
            user_info,
        }
    }
}

fn alert(user_info: &Value) -> Option<&serde_json::Map<String, Value>> {
    user_info.get("aps")?.get("alert")?.as_object()
}

pub fn alert_title(user_info: &Value) -> Option<&str> {
    alert(user_info)?.get("title")?.as_str()
}

pub fn alert_body(user_info: &Value) -> Option<&str> {
    alert(user_info)?.get("body")?.as_str()
}

pub fn message_id(user_info: &Value) -> Option<&str> {
    user_info.get(MESSAGE_ID_KEY)?.as_str()
}

pub fn image_url(user_info: &Value) -> Option<&str> {
    user_info.get("fcm_options")?.get("image")?.as_str()
}

/// Formats a raw device token as two lower-case hex digits per byte.
pub fn apns_token_string(token: &[u8]) -> String {
    hex::encode(token)
}

/// Builds the cached record for a delivered notification. Missing title or
/// body become empty strings.
pub fn record_from_delivered(
    notification: &DeliveredNotification,
    is_read: bool,
    tags: Option<Vec<String>>,
) -> NotificationRecord {
    let info = &notification.user_info;
    let mut record = NotificationRecord::new(
        notification.identifier.clone(),
        notification.date,
        alert_title(info).unwrap_or_default(),
        alert_body(info).unwrap_or_default(),
    )
    .with_read(is_read);
    record.image_url = image_url(info).map(str::to_string);
    if let Some(tags) = tags {
        record.add_tags(tags);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn delivered(user_info: Value) -> DeliveredNotification {
        DeliveredNotification::new("req-1", Utc.timestamp_opt(1_000, 0).unwrap(), user_info)
    }

    #[test]
    fn extracts_alert_fields() {
        let info = json!({
            "aps": { "alert": { "title": "Hi", "body": "There" } },
            "gcm.message_id": "0:123",
            "fcm_options": { "image": "https://example.com/a.png" }
        });
        assert_eq!(alert_title(&info), Some("Hi"));
        assert_eq!(alert_body(&info), Some("There"));
        assert_eq!(message_id(&info), Some("0:123"));
        assert_eq!(image_url(&info), Some("https://example.com/a.png"));
    }

    #[test]
    fn string_alerts_have_no_title() {
        let info = json!({ "aps": { "alert": "plain text" } });
        assert_eq!(alert_title(&info), None);
        assert_eq!(alert_body(&info), None);
    }

    #[test]
    fn token_is_hex_encoded_per_byte() {
        assert_eq!(apns_token_string(&[0x00, 0x0f, 0xab, 0xff]), "000fabff");
        assert_eq!(apns_token_string(&[]), "");
    }

    #[test]
    fn record_defaults_missing_text() {
        let record = record_from_delivered(&delivered(json!({})), true, None);
        assert_eq!(record.id, "req-1");
        assert_eq!(record.title, "");
        assert_eq!(record.body, "");
        assert!(record.is_read);
        assert_eq!(record.tags, None);
        assert_eq!(record.image_url, None);
    }

    #[test]
    fn record_is_stamped_with_lowercased_tags() {
        let info = json!({ "aps": { "alert": { "title": "T", "body": "B" } } });
        let record = record_from_delivered(&delivered(info), false, Some(vec!["Promo".into()]));
        assert_eq!(record.title, "T");
        assert_eq!(record.tags, Some(vec!["promo".to_string()]));
    }
}
