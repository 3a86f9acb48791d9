use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use inbox_core::events::DEFAULT_DELIVERY_DELAY;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub(crate) data_path: PathBuf,
    pub(crate) input: Option<PathBuf>,
    pub(crate) channels: Vec<String>,
    pub(crate) tags: Vec<String>,
    pub(crate) event_delay: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_lookup(|key| std::env::var(key).ok()))
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup("PUSH_INBOX_DATA") {
            if !path.trim().is_empty() {
                config.data_path = PathBuf::from(path.trim());
            }
        }
        if let Some(path) = lookup("PUSH_INBOX_INPUT") {
            if !path.trim().is_empty() {
                config.input = Some(PathBuf::from(path.trim()));
            }
        }
        if let Some(list) = lookup("PUSH_INBOX_CHANNELS") {
            for channel in split_list(&list) {
                config.push_channel(channel);
            }
        }
        if let Some(list) = lookup("PUSH_INBOX_TAGS") {
            config.tags = split_list(&list);
        }
        if let Some(delay) = lookup("PUSH_INBOX_EVENT_DELAY_MS") {
            match delay.trim().parse::<u64>() {
                Ok(value) => config.event_delay = Duration::from_millis(value),
                Err(err) => debug!(%delay, %err, "ignoring invalid event delay"),
            }
        }
        config
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = String>) -> Self {
        for channel in channels {
            self.push_channel(channel);
        }
        self
    }

    pub fn data_path(&self) -> &PathBuf {
        &self.data_path
    }

    pub fn input(&self) -> Option<&PathBuf> {
        self.input.as_ref()
    }

    fn push_channel(&mut self, channel: String) {
        if !self.channels.contains(&channel) {
            info!(%channel, "registering push channel");
            self.channels.push(channel);
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("push_inbox.json"),
            input: None,
            channels: Vec::new(),
            tags: Vec::new(),
            event_delay: DEFAULT_DELIVERY_DELAY,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
