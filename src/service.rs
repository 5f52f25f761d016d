//! The owned service: one store, one listener and one selection pipeline,
//! built at startup and shut down explicitly.

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use tracing::info;

use crate::config::{self, Config, SmtpConfig};
use crate::error::Result;
use crate::model::MessageEntry;
use crate::pipeline::{PublishQueue, SelectionPipeline};
use crate::smtp::{rebind, SmtpListener};
use crate::store::{MessageStore, StoreEvent};

/// Receivers the consumer polls on its own thread.
pub struct ServiceChannels {
    /// One message per successfully received and registered delivery.
    pub arrivals: Receiver<MessageEntry>,
    /// Every registry mutation, including deletions made by the consumer.
    pub store_events: Receiver<StoreEvent>,
    /// Previews for the current selection.
    pub previews: PublishQueue,
}

pub struct MailService {
    config: Config,
    store: Arc<MessageStore>,
    listener: SmtpListener,
    pipeline: SelectionPipeline,
}

impl MailService {
    /// Open the message directory and wire the components together.
    ///
    /// The listener is not started; see [`MailService::start_listener`].
    pub fn open(config: Config) -> Result<(Self, ServiceChannels)> {
        let dir = config::message_dir(&config);
        let store = Arc::new(MessageStore::open(&dir, &config.storage.extension)?);
        let store_events = store.subscribe();

        let (arrivals_tx, arrivals) = mpsc::channel();
        let listener = SmtpListener::new(config.smtp.clone(), Arc::clone(&store), arrivals_tx);
        let (pipeline, previews) = SelectionPipeline::new(config.preview.read_chunk_size);

        let service = Self {
            config,
            store,
            listener,
            pipeline,
        };
        let channels = ServiceChannels {
            arrivals,
            store_events,
            previews,
        };
        Ok((service, channels))
    }

    /// Bind the listener to the configured address.
    pub fn start_listener(&mut self) -> Result<SocketAddr> {
        let smtp = &self.config.smtp;
        self.listener.start(&smtp.host, smtp.port)
    }

    /// Move the listener to new settings. On failure the listener is stopped
    /// and the caller is expected to ask for other settings.
    pub fn rebind(&mut self, smtp: SmtpConfig) -> Result<SocketAddr> {
        self.config.smtp = smtp.clone();
        rebind::apply(&mut self.listener, smtp)
    }

    pub fn listener(&self) -> &SmtpListener {
        &self.listener
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Show `entry`; supersedes whatever was selected before.
    pub fn select(&self, entry: MessageEntry) -> u64 {
        self.pipeline.select(entry)
    }

    pub fn clear_selection(&self) -> u64 {
        self.pipeline.clear()
    }

    pub fn pipeline(&self) -> &SelectionPipeline {
        &self.pipeline
    }

    /// Delete a message file and drop it from the registry.
    pub fn delete(&self, entry: &MessageEntry) -> Result<()> {
        self.store.remove(entry)
    }

    /// Stop accepting mail and abandon in-flight previews.
    pub fn shutdown(mut self) {
        self.pipeline.cancel();
        self.listener.stop();
        info!(
            messages = self.store.len(),
            "Service stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.message_dir = Some(dir.to_path_buf());
        config.smtp.port = 0;
        config
    }

    #[test]
    fn test_open_loads_existing_messages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.eml"), "Subject: old\n\n").unwrap();

        let (service, _channels) = MailService::open(config_in(dir.path())).unwrap();
        assert_eq!(service.store().len(), 1);
        assert!(!service.listener().is_bound());
    }

    #[test]
    fn test_start_rebind_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _channels) = MailService::open(config_in(dir.path())).unwrap();

        service.start_listener().unwrap();
        assert!(service.listener().is_bound());

        let moved = SmtpConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..service.config().smtp.clone()
        };
        service.rebind(moved).unwrap();
        assert!(service.listener().is_bound());
        service.shutdown();
    }

    #[test]
    fn test_delete_emits_store_event() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.eml"), "Subject: a\n\n").unwrap();
        let (service, channels) = MailService::open(config_in(dir.path())).unwrap();

        let entry = service.store().list()[0].clone();
        service.delete(&entry).unwrap();
        assert_eq!(
            channels.store_events.try_recv().unwrap(),
            StoreEvent::Removed(entry)
        );
        assert!(service.store().is_empty());
    }
}
