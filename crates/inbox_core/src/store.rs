use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    blob::{self, keys, BlobStore},
    container::{sort_records, RecordContainer},
    error::StoreResult,
    events::{EventBus, StoreEvent},
    gate::PendingGate,
    record::NotificationRecord,
};

#[derive(Debug, Default)]
struct StoreState {
    token: Option<String>,
    fcm_token: Option<String>,
    records: RecordContainer,
    tags: Option<Vec<String>>,
}

/// Local cache of received notifications, tokens and the tag whitelist.
///
/// Every mutation runs under one lock, persists what it changed to the blob
/// store and queues the resulting events on the bus. Persistence failures are
/// logged and otherwise ignored: the cache is best-effort.
pub struct NotificationStore {
    blobs: Arc<dyn BlobStore>,
    bus: EventBus,
    gate: PendingGate,
    state: Mutex<StoreState>,
}

impl NotificationStore {
    /// Restores the store from `blobs`. Anything missing or malformed starts empty.
    pub fn load(blobs: Arc<dyn BlobStore>, bus: EventBus) -> Self {
        let token = read_or_default(blobs.as_ref(), keys::DEVICE_TOKEN, |store, key| store.get(key));
        let fcm_token = read_or_default(blobs.as_ref(), keys::PUSH_TOKEN, |store, key| store.get(key));
        let tags = read_or_default(blobs.as_ref(), keys::TAGS, blob::get_json::<Vec<String>>);
        let stored = read_or_default(blobs.as_ref(), keys::RECORDS, blob::get_json::<RecordContainer>);

        let missing = stored.is_none();
        let store = Self {
            blobs,
            bus,
            gate: PendingGate::new(),
            state: Mutex::new(StoreState {
                token,
                fcm_token,
                records: stored.unwrap_or_default(),
                tags,
            }),
        };
        if missing {
            store.persist_records(&store.state.lock());
        }
        tracing::info!(records = store.len(), "notification store loaded");
        store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn gate(&self) -> &PendingGate {
        &self.gate
    }

    /// Writes every persisted value back to the blob store.
    pub fn save(&self) {
        let state = self.state.lock();
        self.persist_token(keys::DEVICE_TOKEN, state.token.as_deref());
        self.persist_token(keys::PUSH_TOKEN, state.fcm_token.as_deref());
        self.persist_records(&state);
        self.persist_tags(&state);
    }

    pub fn token(&self) -> Option<String> {
        self.state.lock().token.clone()
    }

    pub fn fcm_token(&self) -> Option<String> {
        self.state.lock().fcm_token.clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        let _guard = self.gate.enter();
        let mut state = self.state.lock();
        state.token = token;
        self.persist_token(keys::DEVICE_TOKEN, state.token.as_deref());
    }

    pub fn set_fcm_token(&self, token: Option<String>) {
        let _guard = self.gate.enter();
        let mut state = self.state.lock();
        state.fcm_token = token;
        self.persist_token(keys::PUSH_TOKEN, state.fcm_token.as_deref());
    }

    /// All records, ascending by date.
    pub fn records(&self) -> Vec<NotificationRecord> {
        self.state.lock().records.ordered()
    }

    pub fn get(&self, id: &str) -> Option<NotificationRecord> {
        self.state.lock().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The store-level tag whitelist stamped onto newly received records.
    pub fn tags(&self) -> Option<Vec<String>> {
        self.state.lock().tags.clone()
    }

    /// Merges `records` into the set.
    ///
    /// Non-forced inserts leave existing ids untouched; forced inserts
    /// overwrite them. Events follow the change in set size: a grown set
    /// yields `RecordReceived` for a single-record call and `Update`
    /// otherwise. An unchanged size yields `RecordRead` only for a single
    /// forced record marked read, and nothing in every other case.
    pub fn insert(&self, records: Vec<NotificationRecord>, forced: bool) {
        let _guard = self.gate.enter();
        let mut state = self.state.lock();

        let old_count = state.records.len();
        let single = records.len() == 1;
        let mut last = None;
        for mut record in records {
            record.normalize_tags();
            if forced {
                state.records.update(record.clone());
            } else {
                state.records.insert(record.clone());
            }
            last = Some(record);
        }
        let new_count = state.records.len();

        let event = match last {
            Some(record) if new_count != old_count && single => {
                Some(StoreEvent::RecordReceived(record))
            }
            _ if new_count != old_count => Some(StoreEvent::Update),
            Some(record) if single && forced && record.is_read => {
                Some(StoreEvent::RecordRead(record))
            }
            _ => None,
        };
        tracing::debug!(
            forced,
            added = new_count - old_count,
            total = new_count,
            event = event.as_ref().map(|e| e.kind().topic()),
            "inserted records"
        );

        self.persist_records(&state);
        drop(state);
        if let Some(event) = event {
            self.bus.publish(event);
        }
    }

    /// Sets the read flag of the record with `id`. Unknown ids are ignored.
    pub fn update_read_state(&self, id: &str, is_read: bool, notify: bool) {
        let _guard = self.gate.enter();
        let mut state = self.state.lock();
        let Some(mut record) = state.records.get(id).cloned() else {
            tracing::debug!(id, "read state update for unknown record ignored");
            return;
        };
        record.is_read = is_read;
        state.records.update(record);
        self.persist_records(&state);
        drop(state);
        self.notify_update(notify);
    }

    /// Upserts `record`, overwriting any record with the same id.
    pub fn update(&self, mut record: NotificationRecord, notify: bool) {
        let _guard = self.gate.enter();
        record.normalize_tags();
        let mut state = self.state.lock();
        state.records.update(record);
        self.persist_records(&state);
        drop(state);
        self.notify_update(notify);
    }

    pub fn clear(&self, notify: bool) {
        let _guard = self.gate.enter();
        let mut state = self.state.lock();
        state.records = RecordContainer::new();
        self.persist_records(&state);
        drop(state);
        tracing::debug!("cleared cached notifications");
        self.notify_update(notify);
    }

    /// Records that are untagged (when `need_untagged` is set) or share a tag
    /// with `tags`, ascending by date.
    pub fn search<S: AsRef<str>>(
        &self,
        tags: Option<&[S]>,
        need_untagged: bool,
    ) -> Vec<NotificationRecord> {
        let state = self.state.lock();
        let mut found: Vec<NotificationRecord> = state
            .records
            .iter()
            .filter(|record| record.contains_tags(tags, need_untagged))
            .cloned()
            .collect();
        sort_records(&mut found);
        found
    }

    /// Removes and returns every record [`search`](Self::search) matches for `tags`.
    pub fn remove_by_tags<S: AsRef<str>>(
        &self,
        tags: Option<&[S]>,
        notify: bool,
    ) -> Vec<NotificationRecord> {
        let _guard = self.gate.enter();
        let mut state = self.state.lock();
        let mut removed: Vec<NotificationRecord> = state
            .records
            .iter()
            .filter(|record| record.contains_tags(tags, false))
            .cloned()
            .collect();
        if removed.is_empty() {
            return removed;
        }
        for record in &removed {
            state.records.remove(record);
        }
        self.persist_records(&state);
        drop(state);
        sort_records(&mut removed);
        tracing::debug!(removed = removed.len(), "removed records by tag");
        self.notify_update(notify);
        removed
    }

    /// Adds lower-cased tags to the whitelist, skipping ones already present.
    pub fn add_tags<S: AsRef<str>>(&self, tags: &[S]) {
        let _guard = self.gate.enter();
        let mut state = self.state.lock();
        let list = state.tags.get_or_insert_with(Vec::new);
        for tag in tags {
            let tag = tag.as_ref().to_lowercase();
            if !list.contains(&tag) {
                list.push(tag);
            }
        }
        self.persist_tags(&state);
    }

    pub fn remove_tags<S: AsRef<str>>(&self, tags: &[S]) {
        let _guard = self.gate.enter();
        let mut state = self.state.lock();
        let Some(list) = state.tags.as_mut() else {
            return;
        };
        let doomed: Vec<String> = tags.iter().map(|tag| tag.as_ref().to_lowercase()).collect();
        list.retain(|tag| !doomed.contains(tag));
        self.persist_tags(&state);
    }

    pub fn clear_tags(&self) {
        let _guard = self.gate.enter();
        let mut state = self.state.lock();
        state.tags = None;
        self.persist_tags(&state);
    }
}

impl NotificationStore {
    fn notify_update(&self, notify: bool) {
        if notify {
            self.bus.publish(StoreEvent::Update);
        }
    }

    fn persist_token(&self, key: &str, token: Option<&str>) {
        let result = match token {
            Some(token) => self.blobs.set(key, token),
            None => self.blobs.remove(key),
        };
        warn_on_failure(key, result);
    }

    fn persist_records(&self, state: &StoreState) {
        warn_on_failure(
            keys::RECORDS,
            blob::set_json(self.blobs.as_ref(), keys::RECORDS, &state.records),
        );
    }

    fn persist_tags(&self, state: &StoreState) {
        let result = match &state.tags {
            Some(tags) => blob::set_json(self.blobs.as_ref(), keys::TAGS, tags),
            None => self.blobs.remove(keys::TAGS),
        };
        warn_on_failure(keys::TAGS, result);
    }
}

fn read_or_default<T>(
    blobs: &dyn BlobStore,
    key: &str,
    read: impl FnOnce(&dyn BlobStore, &str) -> StoreResult<Option<T>>,
) -> Option<T> {
    match read(blobs, key) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(key, %err, "ignoring unreadable stored value");
            None
        }
    }
}

fn warn_on_failure(key: &str, result: StoreResult<()>) {
    if let Err(err) = result {
        tracing::warn!(key, %err, "failed to persist notification store value");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::events::EventKind;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct Harness {
        blobs: Arc<MemoryBlobStore>,
        store: NotificationStore,
        events: Arc<Mutex<Vec<StoreEvent>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_blobs(Arc::new(MemoryBlobStore::new()))
        }

        fn with_blobs(blobs: Arc<MemoryBlobStore>) -> Self {
            let bus = EventBus::with_delay(Duration::ZERO);
            let events = Arc::new(Mutex::new(Vec::new()));
            for kind in EventKind::ALL {
                let sink = Arc::clone(&events);
                bus.subscribe(kind, move |event| sink.lock().push(event.clone()));
            }
            let store = NotificationStore::load(blobs.clone(), bus);
            Self {
                blobs,
                store,
                events,
            }
        }

        fn drain(&self) -> Vec<StoreEvent> {
            self.store.bus().dispatch_all();
            std::mem::take(&mut *self.events.lock())
        }
    }

    fn record(id: &str, secs: i64) -> NotificationRecord {
        NotificationRecord::new(id, Utc.timestamp_opt(secs, 0).unwrap(), format!("title {id}"), "")
    }

    #[test]
    fn single_fresh_record_emits_record_received() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1)], false);

        assert_eq!(h.store.len(), 1);
        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StoreEvent::RecordReceived(r) if r.id == "a"));
    }

    #[test]
    fn fresh_batch_emits_single_update() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1), record("b", 2), record("c", 3)], false);

        assert_eq!(h.store.len(), 3);
        assert_eq!(h.drain(), vec![StoreEvent::Update]);
    }

    #[test]
    fn partially_new_batch_emits_update() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1)], false);
        h.drain();

        h.store.insert(vec![record("a", 1), record("b", 2)], false);
        assert_eq!(h.drain(), vec![StoreEvent::Update]);
    }

    #[test]
    fn duplicate_insert_is_a_silent_no_op() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1)], false);
        h.drain();

        h.store.insert(vec![record("a", 1).with_read(true)], false);
        assert_eq!(h.store.len(), 1);
        assert!(h.drain().is_empty());
        assert!(!h.store.get("a").unwrap().is_read);
    }

    #[test]
    fn forced_read_reinsert_emits_record_read() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1)], false);
        h.drain();

        h.store.insert(vec![record("a", 1).with_read(true)], true);
        assert_eq!(h.store.len(), 1);
        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StoreEvent::RecordRead(r) if r.id == "a" && r.is_read));
        assert!(h.store.get("a").unwrap().is_read);
    }

    #[test]
    fn forced_unread_reinsert_overwrites_silently() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1)], false);
        h.drain();

        let mut changed = record("a", 1);
        changed.title = "renamed".into();
        h.store.insert(vec![changed], true);
        assert!(h.drain().is_empty());
        assert_eq!(h.store.get("a").unwrap().title, "renamed");
    }

    #[test]
    fn forced_fresh_record_still_reports_received() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1).with_read(true)], true);
        let events = h.drain();
        assert!(matches!(&events[..], [StoreEvent::RecordReceived(r)] if r.id == "a"));
    }

    #[test]
    fn empty_batch_emits_nothing() {
        let h = Harness::new();
        h.store.insert(Vec::new(), false);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn inserted_tags_are_lowercased() {
        let h = Harness::new();
        let mut tagged = record("a", 1);
        tagged.tags = Some(vec!["News".into()]);
        h.store.insert(vec![tagged], false);
        assert_eq!(h.store.get("a").unwrap().tags, Some(vec!["news".to_string()]));
    }

    #[test]
    fn update_read_state_flips_flag_and_notifies() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1)], false);
        h.drain();

        h.store.update_read_state("a", true, true);
        assert!(h.store.get("a").unwrap().is_read);
        assert_eq!(h.drain(), vec![StoreEvent::Update]);

        h.store.update_read_state("a", false, false);
        assert!(!h.store.get("a").unwrap().is_read);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn update_read_state_ignores_unknown_ids() {
        let h = Harness::new();
        h.store.update_read_state("missing", true, true);
        assert!(h.store.is_empty());
        assert!(h.drain().is_empty());
    }

    #[test]
    fn update_upserts_and_notifies() {
        let h = Harness::new();
        h.store.update(record("a", 1), true);
        h.store.update(record("a", 1).with_read(true), false);
        assert_eq!(h.store.len(), 1);
        assert!(h.store.get("a").unwrap().is_read);
        assert_eq!(h.drain(), vec![StoreEvent::Update]);
    }

    #[test]
    fn clear_is_idempotent() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1), record("b", 2)], false);
        h.drain();

        h.store.clear(true);
        assert!(h.store.is_empty());
        assert_eq!(h.drain(), vec![StoreEvent::Update]);

        h.store.clear(true);
        assert!(h.store.is_empty());
        assert_eq!(h.drain(), vec![StoreEvent::Update]);
    }

    #[test]
    fn search_matches_tags_case_insensitively() {
        let h = Harness::new();
        h.store.insert(
            vec![
                record("a", 1).with_tags(["a"]),
                record("b", 2).with_tags(["b"]),
                record("c", 3),
            ],
            false,
        );

        let ids = |records: Vec<NotificationRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.id).collect()
        };
        assert_eq!(ids(h.store.search(Some(&["A"][..]), false)), ["a"]);
        assert_eq!(ids(h.store.search(Some(&["A"][..]), true)), ["a", "c"]);
        assert_eq!(ids(h.store.search(Some(&["a", "B"][..]), false)), ["a", "b"]);
        assert!(h.store.search::<&str>(None, false).is_empty());
        assert_eq!(ids(h.store.search::<&str>(None, true)), ["c"]);
    }

    #[test]
    fn remove_by_tags_removes_exactly_the_matches() {
        let h = Harness::new();
        h.store.insert(
            vec![
                record("a", 1).with_tags(["x"]),
                record("b", 2).with_tags(["X", "y"]),
                record("c", 3).with_tags(["y"]),
                record("d", 4),
            ],
            false,
        );
        h.drain();

        let tags = ["x"];
        let expected: Vec<String> = h.store.search(Some(&tags[..]), false).into_iter().map(|r| r.id).collect();
        let removed: Vec<String> = h
            .store
            .remove_by_tags(Some(&tags[..]), true)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(removed, expected);
        assert_eq!(removed, ["a", "b"]);
        assert!(h.store.search(Some(&tags[..]), false).is_empty());
        assert_eq!(h.store.len(), 2);
        assert_eq!(h.drain(), vec![StoreEvent::Update]);
    }

    #[test]
    fn remove_by_tags_without_matches_is_silent() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1)], false);
        h.drain();
        assert!(h.store.remove_by_tags(Some(&["zzz"][..]), true).is_empty());
        assert!(h.store.remove_by_tags::<&str>(None, true).is_empty());
        assert!(h.drain().is_empty());
    }

    #[test]
    fn tag_whitelist_is_case_folded_and_emits_nothing() {
        let h = Harness::new();
        h.store.add_tags(&["News", "sport", "NEWS"]);
        assert_eq!(h.store.tags(), Some(vec!["news".to_string(), "sport".to_string()]));

        h.store.remove_tags(&["SPORT"]);
        assert_eq!(h.store.tags(), Some(vec!["news".to_string()]));

        h.store.clear_tags();
        assert_eq!(h.store.tags(), None);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn state_survives_reload() {
        let h = Harness::new();
        h.store.set_token(Some("abcd".into()));
        h.store.set_fcm_token(Some("push".into()));
        h.store.add_tags(&["one"]);
        h.store.insert(vec![record("a", 1).with_read(true), record("b", 2)], false);

        let reloaded = Harness::with_blobs(h.blobs.clone());
        assert_eq!(reloaded.store.token().as_deref(), Some("abcd"));
        assert_eq!(reloaded.store.fcm_token().as_deref(), Some("push"));
        assert_eq!(reloaded.store.tags(), Some(vec!["one".to_string()]));
        let ids: Vec<String> = reloaded.store.records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(reloaded.store.get("a").unwrap().is_read);
    }

    #[test]
    fn save_rewrites_every_persisted_key() {
        let h = Harness::new();
        h.store.set_token(Some("00ff".into()));
        h.store.set_fcm_token(Some("fcm-1".into()));
        h.store.add_tags(&["Promo"]);
        h.store.insert(vec![record("a", 1).with_tags(["promo"])], false);
        for key in [keys::DEVICE_TOKEN, keys::PUSH_TOKEN, keys::RECORDS, keys::TAGS] {
            h.blobs.remove(key).unwrap();
        }
        assert!(h.blobs.keys().is_empty());

        h.store.save();
        assert_eq!(
            h.blobs.keys(),
            [keys::DEVICE_TOKEN, keys::PUSH_TOKEN, keys::RECORDS, keys::TAGS]
        );
        assert_eq!(h.blobs.get(keys::DEVICE_TOKEN).unwrap().as_deref(), Some("00ff"));
        assert_eq!(h.blobs.get(keys::PUSH_TOKEN).unwrap().as_deref(), Some("fcm-1"));
        let tags: Option<Vec<String>> = blob::get_json(&*h.blobs, keys::TAGS).unwrap();
        assert_eq!(tags, Some(vec!["promo".to_string()]));
        let records: Option<RecordContainer> =
            blob::get_json(&*h.blobs, keys::RECORDS).unwrap();
        let records = records.expect("records saved");
        assert_eq!(records.len(), 1);
        assert_eq!(records.get("a").and_then(|r| r.tags.clone()), Some(vec!["promo".to_string()]));
    }

    #[test]
    fn save_drops_the_device_token_key_when_unset() {
        let h = Harness::new();
        h.store.set_token(None);
        h.blobs.set(keys::DEVICE_TOKEN, "stale").unwrap();

        h.store.save();
        assert_eq!(h.blobs.get(keys::DEVICE_TOKEN).unwrap(), None);
        assert!(h.blobs.get(keys::RECORDS).unwrap().is_some());
    }

    #[test]
    fn clearing_tokens_removes_their_keys() {
        let h = Harness::new();
        h.store.set_token(Some("abcd".into()));
        h.store.set_token(None);
        assert_eq!(h.blobs.get(keys::DEVICE_TOKEN).unwrap(), None);
        assert_eq!(h.store.token(), None);
    }

    #[test]
    fn malformed_records_load_as_empty() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.set(keys::RECORDS, "{not json").unwrap();
        blobs.set(keys::TAGS, "42").unwrap();

        let h = Harness::with_blobs(blobs);
        assert!(h.store.is_empty());
        assert_eq!(h.store.tags(), None);
    }

    #[test]
    fn load_persists_an_empty_container() {
        let h = Harness::new();
        assert!(h.blobs.get(keys::RECORDS).unwrap().is_some());
    }

    #[test]
    fn mutations_leave_the_gate_idle() {
        let h = Harness::new();
        h.store.insert(vec![record("a", 1)], false);
        h.store.clear(false);
        assert_eq!(h.store.gate().pending(), 0);
        assert!(h.store.gate().wait_idle(Duration::ZERO));
    }
}
