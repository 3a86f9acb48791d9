use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One cached notification. Identity is the `id`; every other field is payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    #[serde(with = "epoch_seconds")]
    pub date: DateTime<Utc>,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(rename = "isReaded", default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl NotificationRecord {
    pub fn new(
        id: impl Into<String>,
        date: DateTime<Utc>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            date,
            title: title.into(),
            body: body.into(),
            image_url: None,
            is_read: false,
            tags: None,
        }
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn with_read(mut self, is_read: bool) -> Self {
        self.is_read = is_read;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add_tags(tags);
        self
    }

    /// Appends the given tags lower-cased, creating the tag list when absent.
    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = self.tags.get_or_insert_with(Vec::new);
        list.extend(tags.into_iter().map(|tag| tag.as_ref().to_lowercase()));
    }

    pub fn is_untagged(&self) -> bool {
        self.tags.as_ref().map_or(true, |tags| tags.is_empty())
    }

    /// Matches when `need_untagged` is set and the record carries no tags, or
    /// when any of the query tags (compared case-insensitively) is present.
    pub fn contains_tags<S: AsRef<str>>(&self, tags: Option<&[S]>, need_untagged: bool) -> bool {
        if need_untagged && self.is_untagged() {
            return true;
        }
        let (Some(query), Some(own)) = (tags, self.tags.as_ref()) else {
            return false;
        };
        query.iter().any(|tag| {
            let wanted = tag.as_ref().to_lowercase();
            own.iter().any(|candidate| candidate.to_lowercase() == wanted)
        })
    }

    pub(crate) fn normalize_tags(&mut self) {
        if let Some(tags) = self.tags.as_mut() {
            for tag in tags.iter_mut() {
                *tag = tag.to_lowercase();
            }
        }
    }
}

impl PartialEq for NotificationRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NotificationRecord {}

impl Hash for NotificationRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Persists timestamps as fractional seconds since the Unix epoch.
mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        let seconds =
            date.timestamp() as f64 + f64::from(date.timestamp_subsec_nanos()) / 1_000_000_000.0;
        serializer.serialize_f64(seconds)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        if !seconds.is_finite() {
            return Err(D::Error::custom("timestamp is not a finite number"));
        }
        let whole = seconds.floor();
        let nanos = ((seconds - whole) * 1_000_000_000.0).round() as u32;
        DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
            .ok_or_else(|| D::Error::custom("timestamp out of range"))
    }
}
