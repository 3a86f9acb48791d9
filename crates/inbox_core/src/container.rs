use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::NotificationRecord;

/// Deduplicated set of records keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "ContainerRepr", into = "ContainerRepr")]
pub struct RecordContainer {
    items: HashMap<String, NotificationRecord>,
}

#[derive(Serialize, Deserialize)]
struct ContainerRepr {
    #[serde(default)]
    items: Vec<NotificationRecord>,
}

impl From<ContainerRepr> for RecordContainer {
    fn from(repr: ContainerRepr) -> Self {
        let mut container = RecordContainer::new();
        for record in repr.items {
            container.insert(record);
        }
        container
    }
}

impl From<RecordContainer> for ContainerRepr {
    fn from(container: RecordContainer) -> Self {
        Self {
            items: container.items.into_values().collect(),
        }
    }
}

impl RecordContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the record unless its id is already present. Returns whether it was added.
    pub fn insert(&mut self, record: NotificationRecord) -> bool {
        if self.items.contains_key(&record.id) {
            return false;
        }
        self.items.insert(record.id.clone(), record);
        true
    }

    /// Replaces the record with the same id, or inserts it. Returns the replaced record.
    pub fn update(&mut self, record: NotificationRecord) -> Option<NotificationRecord> {
        self.items.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, record: &NotificationRecord) -> Option<NotificationRecord> {
        self.remove_id(&record.id)
    }

    pub fn remove_id(&mut self, id: &str) -> Option<NotificationRecord> {
        self.items.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&NotificationRecord> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.items.values()
    }

    /// Snapshot sorted ascending by date; equal dates fall back to id order.
    pub fn ordered(&self) -> Vec<NotificationRecord> {
        let mut records: Vec<NotificationRecord> = self.items.values().cloned().collect();
        sort_records(&mut records);
        records
    }
}

pub(crate) fn sort_records(records: &mut [NotificationRecord]) {
    records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
}
