use std::fs::File;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use inbox_core::{
    payload::DeliveredNotification, BlobStore, EventBus, FileBlobStore, NotificationRecord,
    NotificationStore, Notificator, PushDelegate, PushHandler, PushProvider, Storage, StoreEvent,
    Subscription,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

/// Upper bound on delivery rounds in [`InboxApp::settle`]; observers that
/// publish from their callbacks would otherwise keep it busy forever.
const MAX_SETTLE_ROUNDS: usize = 64;

/// One line of host input: something the platform would have told the app.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    ApnsToken { bytes: Vec<u8> },
    RegistrationToken { token: String },
    RegistrationFailed { reason: String },
    DataMessage { data: Value },
    Presented(DeliveredNotification),
    Tapped(DeliveredNotification),
    Foreground { delivered: Vec<DeliveredNotification> },
    MarkRead { id: String, is_read: bool },
    Clear,
    AddTags { tags: Vec<String> },
    RemoveTags { tags: Vec<String> },
    ClearTags,
    RemoveByTags { tags: Option<Vec<String>> },
}

/// Stand-in for the push SDK when running headless: it only logs.
#[derive(Debug, Default)]
pub struct LoggingProvider;

impl PushProvider for LoggingProvider {
    fn set_apns_token(&self, token: &[u8]) {
        debug!(bytes = token.len(), "handing device token to push provider");
    }

    fn subscribe_to_channels(&self, channels: &[String]) {
        for channel in channels {
            info!(%channel, "subscribing to push channel");
        }
    }
}

/// Counts delivered events per kind and logs them.
#[derive(Debug, Default)]
pub struct EventTally {
    updates: AtomicUsize,
    received: AtomicUsize,
    read: AtomicUsize,
}

impl EventTally {
    pub fn counts(&self) -> EventCounts {
        EventCounts {
            update: self.updates.load(Ordering::SeqCst),
            record_received: self.received.load(Ordering::SeqCst),
            record_read: self.read.load(Ordering::SeqCst),
        }
    }
}

impl Notificator for EventTally {
    fn on_update(&self) {
        self.updates.fetch_add(1, Ordering::SeqCst);
        info!("notification cache updated");
    }

    fn on_record_received(&self, event: &StoreEvent) {
        self.received.fetch_add(1, Ordering::SeqCst);
        if let Some(record) = Self::unpack(event) {
            info!(id = %record.id, title = %record.title, "notification received");
        }
    }

    fn on_record_read(&self, event: &StoreEvent) {
        self.read.fetch_add(1, Ordering::SeqCst);
        if let Some(record) = Self::unpack(event) {
            info!(id = %record.id, "notification read");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub update: usize,
    pub record_received: usize,
    pub record_read: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub all: usize,
    pub read: usize,
    pub unread: usize,
    pub tags: Option<Vec<String>>,
    pub events: EventCounts,
    pub records: Vec<NotificationRecord>,
}

/// Composition root: owns the store, the bus and the delegate for one run.
pub struct InboxApp {
    store: Arc<NotificationStore>,
    handler: PushHandler,
    tally: Arc<EventTally>,
    subscription: Subscription,
}

impl InboxApp {
    pub fn new(config: &AppConfig) -> Self {
        let blobs = FileBlobStore::open(config.data_path());
        info!(path = %blobs.path().display(), "opened inbox data file");
        Self::with_blobs(config, Arc::new(blobs))
    }

    pub fn with_blobs(config: &AppConfig, blobs: Arc<dyn BlobStore>) -> Self {
        let bus = EventBus::with_delay(config.event_delay);
        debug!(delay_ms = bus.delay().as_millis() as u64, "event bus ready");
        let store = Arc::new(NotificationStore::load(blobs, bus));
        if !config.tags.is_empty() {
            store.add_tags(&config.tags);
        }
        let tally = Arc::new(EventTally::default());
        let subscription = EventTally::subscribe(&tally, store.bus());
        let handler = PushHandler::new(
            Arc::clone(&store),
            Arc::new(LoggingProvider),
            config.channels.clone(),
        );
        debug!(channels = ?handler.channels(), "push handler ready");
        Self {
            store,
            handler,
            tally,
            subscription,
        }
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    pub fn apply(&self, event: HostEvent) {
        match event {
            HostEvent::ApnsToken { bytes } => self.handler.on_token_received(&bytes),
            HostEvent::RegistrationToken { token } => self.handler.on_registration_token(&token),
            HostEvent::RegistrationFailed { reason } => self.handler.on_registration_failed(&reason),
            HostEvent::DataMessage { data } => self.handler.on_message_received(&data),
            HostEvent::Presented(notification) => {
                let options = self.handler.on_notification_presented(&notification);
                debug!(?options, "presenting notification");
            }
            HostEvent::Tapped(notification) => self.handler.on_notification_tapped(&notification),
            HostEvent::Foreground { delivered } => {
                let ticket = self.handler.begin_center_fetch();
                self.handler.complete_center_fetch(ticket, delivered);
            }
            HostEvent::MarkRead { id, is_read } => self.store.update_read_state(&id, is_read, true),
            HostEvent::Clear => self.store.clear(true),
            HostEvent::AddTags { tags } => self.store.add_tags(&tags),
            HostEvent::RemoveTags { tags } => self.store.remove_tags(&tags),
            HostEvent::ClearTags => self.store.clear_tags(),
            HostEvent::RemoveByTags { tags } => {
                let removed = self.store.remove_by_tags(tags.as_deref());
                info!(removed = removed.len(), "removed notifications by tag");
            }
        }
    }

    /// Feeds every JSON line of `input` through the delegate, delivering due
    /// events between lines. Malformed lines are logged and skipped.
    pub fn replay(&self, input: impl BufRead) -> Result<usize> {
        let mut applied = 0;
        for (index, line) in input.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(err) if err.kind() == ErrorKind::InvalidData => {
                    warn!(line = index + 1, %err, "skipping undecodable host input");
                    continue;
                }
                Err(err) => return Err(err).context("failed to read host input"),
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<HostEvent>(trimmed) {
                Ok(event) => {
                    self.apply(event);
                    applied += 1;
                }
                Err(err) => warn!(line = index + 1, %err, "skipping malformed host event"),
            }
            self.store.bus().dispatch_due();
        }
        Ok(applied)
    }

    /// Waits for in-flight work and delivers every outstanding event, honouring
    /// the bus delay. Gives up after a bounded number of delivery rounds.
    pub fn settle(&self) {
        let bus = self.store.bus();
        if !self.store.gate().wait_idle(Duration::from_secs(5)) {
            warn!("store work still pending after timeout");
        }
        for _ in 0..MAX_SETTLE_ROUNDS {
            let Some(due) = bus.next_due() else {
                return;
            };
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
            bus.dispatch_due();
        }
        warn!(pending = bus.pending(), "events still queued after settling");
    }

    pub fn summary(&self) -> Summary {
        Summary {
            all: self.store.all_count(),
            read: self.store.read_count(),
            unread: self.store.unread_count(),
            tags: self.store.tags(),
            events: self.tally.counts(),
            records: self.store.notifications(),
        }
    }

    pub fn shutdown(self) -> Summary {
        self.settle();
        let summary = self.summary();
        self.subscription.unsubscribe();
        summary
    }
}

pub fn run(config: AppConfig) -> Result<()> {
    info!(data = %config.data_path().display(), "starting push inbox");
    let app = InboxApp::new(&config);
    let applied = match config.input() {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open host input {}", path.display()))?;
            app.replay(BufReader::new(file))?
        }
        None => app.replay(io::stdin().lock())?,
    };
    info!(applied, "host input consumed");

    let summary = app.shutdown();
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &summary).context("failed to write summary")?;
    writeln!(stdout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_core::{EventKind, MemoryBlobStore};
    use std::io::Cursor;
    use tempfile::tempdir;

    const SCRIPT: &str = r#"
# registration
{"event":"apns_token","bytes":[222,173,190,239]}
{"event":"registration_token","token":"fcm-1"}
{"event":"add_tags","tags":["Promo"]}
{"event":"presented","identifier":"n-1","date":"2024-01-01T10:00:00Z","user_info":{"aps":{"alert":{"title":"Hello","body":"World"}}}}
{"event":"tapped","identifier":"n-1","date":"2024-01-01T10:00:00Z","user_info":{}}
{"event":"foreground","delivered":[
not json at all
{"event":"foreground","delivered":[{"identifier":"n-2","date":"2024-01-01T09:00:00Z"},{"identifier":"n-3","date":"2024-01-01T11:00:00Z"}]}
"#;

    fn config() -> AppConfig {
        AppConfig::default()
            .with_event_delay(Duration::ZERO)
            .with_channels(["news".to_string()])
    }

    #[test]
    fn replay_drives_the_store_and_observers() {
        let app = InboxApp::with_blobs(&config(), Arc::new(MemoryBlobStore::new()));
        let applied = app.replay(Cursor::new(SCRIPT)).expect("replay");
        assert_eq!(applied, 6);

        let summary = app.shutdown();
        assert_eq!(summary.all, 3);
        assert_eq!(summary.read, 1);
        assert_eq!(summary.unread, 2);
        assert_eq!(summary.tags, Some(vec!["promo".to_string()]));
        assert_eq!(
            summary.events,
            EventCounts {
                update: 1,
                record_received: 1,
                record_read: 1,
            }
        );
        let ids: Vec<&str> = summary.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["n-2", "n-1", "n-3"]);
        assert!(summary.records.iter().all(|r| r.tags.as_deref() == Some(&["promo".to_string()][..])));
    }

    #[test]
    fn replay_skips_lines_that_are_not_utf8() {
        let app = InboxApp::with_blobs(&config(), Arc::new(MemoryBlobStore::new()));
        let input: &[u8] =
            b"{\"event\":\"add_tags\",\"tags\":[\"a\"]}\n\xff\xfe\n{\"event\":\"add_tags\",\"tags\":[\"b\"]}\n";
        let applied = app.replay(input).expect("replay");
        assert_eq!(applied, 2);
        assert_eq!(app.store().tags(), Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn settle_stops_when_observers_keep_publishing() {
        let app = InboxApp::with_blobs(&config(), Arc::new(MemoryBlobStore::new()));
        let store = Arc::downgrade(app.store());
        let id = app.store().bus().subscribe(EventKind::Update, move |_| {
            if let Some(store) = store.upgrade() {
                store.clear(true);
            }
        });

        app.store().clear(true);
        app.settle();
        assert_eq!(app.store().bus().pending(), 1);
        assert_eq!(app.summary().events.update, MAX_SETTLE_ROUNDS);
        app.store().bus().unsubscribe(id);
    }

    #[test]
    fn host_commands_mutate_the_cache() {
        let app = InboxApp::with_blobs(&config(), Arc::new(MemoryBlobStore::new()));
        app.replay(Cursor::new(
            r#"{"event":"foreground","delivered":[{"identifier":"a","date":"2024-01-01T09:00:00Z"},{"identifier":"b","date":"2024-01-01T10:00:00Z"}]}
{"event":"mark_read","id":"a","is_read":true}
{"event":"registration_failed","reason":"denied"}
{"event":"remove_by_tags","tags":null}
{"event":"clear"}
{"event":"clear_tags"}"#,
        ))
        .expect("replay");

        let summary = app.shutdown();
        assert_eq!(summary.all, 0);
        assert_eq!(summary.events.update, 3);
        assert_eq!(summary.tags, None);
    }

    #[test]
    fn file_backed_app_restores_previous_run() {
        let temp = tempdir().expect("tempdir");
        let config = config().with_data_path(temp.path().join("inbox.json"));

        let first = InboxApp::new(&config);
        first
            .replay(Cursor::new(
                r#"{"event":"apns_token","bytes":[1,2]}
{"event":"presented","identifier":"n-1","date":"2024-01-01T10:00:00Z","user_info":{}}"#,
            ))
            .expect("replay");
        first.shutdown();

        let second = InboxApp::new(&config);
        assert_eq!(second.store().apns_token().as_deref(), Some("0102"));
        assert_eq!(second.store().all_count(), 1);
        second
            .replay(Cursor::new(
                r#"{"event":"presented","identifier":"n-1","date":"2024-01-01T10:00:00Z","user_info":{}}"#,
            ))
            .expect("replay");
        assert_eq!(second.shutdown().events.record_received, 0);
    }
}
