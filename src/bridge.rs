//! Bridge orchestration — the poll/dedup/notify loop.
//!
//! One cycle: open a mailbox session, walk the configured folders, list
//! unseen messages, fetch headers in bounded batches, and for each message
//! consult the ledger before (maybe) notifying. Failures are scoped to the
//! smallest unit: a bad message never aborts its batch, a bad folder never
//! aborts its siblings, and a failed connect retries after the normal
//! interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::MailboxError;
use crate::headers::ParsedHeader;
use crate::ledger::Ledger;
use crate::mailbox::{MailboxConnector, MailboxSession};
use crate::notify::{MAX_LOG_SUBJECT_LENGTH, Notifier};

/// Cooperative stop signal shared between the loop and signal handlers.
///
/// The flag is checked between cycles; the notify wakes the loop out of its
/// interval sleep so shutdown does not wait out the poll interval.
#[derive(Default)]
pub struct ShutdownHandle {
    stop: AtomicBool,
    wake: Notify,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    fn is_triggered(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    async fn sleep(&self, interval: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.wake.notified() => {}
        }
    }
}

/// The bridge service: polls IMAP folders and pushes one notification per
/// previously-unseen message.
pub struct Bridge<C: MailboxConnector, N: Notifier> {
    connector: C,
    notifier: N,
    ledger: Ledger,
    folders: Vec<String>,
    batch_size: usize,
    poll_interval: Duration,
    /// True until the first full pass over all folders completes on a fresh
    /// ledger. While set, messages are recorded without notification so a
    /// new deployment does not produce a notification storm.
    first_run: bool,
    shutdown: Arc<ShutdownHandle>,
}

impl<C: MailboxConnector, N: Notifier> Bridge<C, N> {
    pub fn new(config: &BridgeConfig, connector: C, notifier: N, ledger: Ledger) -> Self {
        Self {
            connector,
            notifier,
            ledger,
            folders: config.folders.clone(),
            batch_size: config.batch_size,
            poll_interval: config.check_interval,
            first_run: false,
            shutdown: Arc::new(ShutdownHandle::default()),
        }
    }

    /// Handle for requesting a clean shutdown from another task.
    pub fn shutdown_handle(&self) -> Arc<ShutdownHandle> {
        Arc::clone(&self.shutdown)
    }

    /// Run the poll loop until shutdown is triggered.
    pub async fn run(&mut self) -> crate::error::Result<()> {
        self.first_run = self.ledger.is_empty().await?;
        if self.first_run {
            info!("First run detected - existing unread messages will be recorded without notification");
        }

        info!(
            folders = %self.folders.join(", "),
            interval_secs = self.poll_interval.as_secs(),
            "Bridge started"
        );

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            self.run_cycle().await;

            if self.shutdown.is_triggered() {
                break;
            }
            debug!(secs = self.poll_interval.as_secs(), "Waiting until next check");
            self.shutdown.sleep(self.poll_interval).await;
        }

        info!("Bridge stopped");
        Ok(())
    }

    /// One poll cycle plus the first-run flip on success.
    async fn run_cycle(&mut self) {
        match self.poll_cycle().await {
            Ok(()) => {
                if self.first_run {
                    self.first_run = false;
                    info!("First run complete - new unread messages will now be notified");
                }
            }
            Err(e) => {
                // Connect/login failures retry after the normal interval.
                error!("Poll cycle failed: {e}");
            }
        }
    }

    async fn poll_cycle(&self) -> Result<(), MailboxError> {
        let mut session = self.connector.connect().await?;

        for folder in &self.folders {
            if let Err(e) = self.process_folder(&mut session, folder).await {
                error!(folder = %folder, "Error processing folder: {e}");
            }
        }

        if let Err(e) = session.logout().await {
            debug!("Logout failed: {e}");
        }
        Ok(())
    }

    async fn process_folder(
        &self,
        session: &mut C::Session,
        folder: &str,
    ) -> Result<(), MailboxError> {
        debug!(folder = %folder, "Processing folder");

        let unseen = session.list_unseen(folder).await?;
        debug!(folder = %folder, count = unseen.len(), "Unread messages found");
        if unseen.is_empty() {
            return Ok(());
        }

        for (index, batch) in unseen.chunks(self.batch_size).enumerate() {
            debug!(batch = index + 1, size = batch.len(), "Fetching header batch");
            let headers = session.fetch_headers(batch).await?;
            for (id, raw) in &headers {
                self.process_message(*id, raw).await;
            }
        }
        Ok(())
    }

    /// Handle one fetched message. Never fails the batch: every error path
    /// logs and returns.
    async fn process_message(&self, id: u32, raw: &[u8]) {
        let header = String::from_utf8_lossy(raw);
        if header.contains('\u{FFFD}') {
            warn!(id, "Header contains invalid UTF-8 sequences");
        }

        let parsed = ParsedHeader::parse(&header);
        let Some(message_id) = parsed.message_id else {
            warn!(id, "Could not extract Message-ID, skipping");
            return;
        };

        match self.ledger.contains(&message_id).await {
            Ok(true) => {
                debug!(message_id = %message_id, "Message already processed");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(message_id = %message_id, "Ledger lookup failed: {e}");
                return;
            }
        }

        if self.first_run {
            debug!(
                subject = %parsed.subject.chars().take(MAX_LOG_SUBJECT_LENGTH).collect::<String>(),
                "First run: recording existing message"
            );
            if let Err(e) = self.ledger.record(&message_id).await {
                error!(message_id = %message_id, "Failed to record message: {e}");
            }
            return;
        }

        debug!(
            sender = %parsed.sender,
            subject = %parsed.subject.chars().take(MAX_LOG_SUBJECT_LENGTH).collect::<String>(),
            "New unread message"
        );
        match self.notifier.deliver(&parsed.subject, &parsed.sender).await {
            Ok(()) => {
                if let Err(e) = self.ledger.record(&message_id).await {
                    error!(message_id = %message_id, "Failed to record message: {e}");
                }
            }
            Err(e) => {
                // Leave unrecorded so the next cycle retries it.
                error!("Failed to send notification, will retry next cycle: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::NotifyError;

    fn raw_header(message_id: &str, subject: &str, sender: &str) -> Vec<u8> {
        format!(
            "Message-ID: {message_id}\r\nSubject: {subject}\r\nFrom: {sender}\r\nDate: Tue, 4 Aug 2026 10:00:00 +0000\r\n\r\n"
        )
        .into_bytes()
    }

    fn header_without_message_id() -> Vec<u8> {
        b"Subject: orphan\r\nFrom: a@b.com\r\n\r\n".to_vec()
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        messages: Arc<Mutex<Vec<(u32, Vec<u8>)>>>,
        fetch_calls: Arc<Mutex<Vec<Vec<u32>>>>,
    }

    impl FakeConnector {
        fn push(&self, id: u32, raw: Vec<u8>) {
            self.messages.lock().unwrap().push((id, raw));
        }

        fn fetch_calls(&self) -> Vec<Vec<u32>> {
            self.fetch_calls.lock().unwrap().clone()
        }
    }

    struct FakeSession {
        messages: Arc<Mutex<Vec<(u32, Vec<u8>)>>>,
        fetch_calls: Arc<Mutex<Vec<Vec<u32>>>>,
    }

    #[async_trait]
    impl MailboxConnector for FakeConnector {
        type Session = FakeSession;

        async fn connect(&self) -> Result<FakeSession, MailboxError> {
            Ok(FakeSession {
                messages: Arc::clone(&self.messages),
                fetch_calls: Arc::clone(&self.fetch_calls),
            })
        }
    }

    #[async_trait]
    impl MailboxSession for FakeSession {
        async fn list_unseen(&mut self, _folder: &str) -> Result<Vec<u32>, MailboxError> {
            Ok(self.messages.lock().unwrap().iter().map(|(id, _)| *id).collect())
        }

        async fn fetch_headers(
            &mut self,
            ids: &[u32],
        ) -> Result<Vec<(u32, Vec<u8>)>, MailboxError> {
            self.fetch_calls.lock().unwrap().push(ids.to_vec());
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| ids.contains(id))
                .cloned()
                .collect())
        }

        async fn logout(&mut self) -> Result<(), MailboxError> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeNotifier {
        delivered: Arc<Mutex<Vec<String>>>,
        fail: Arc<AtomicBool>,
    }

    impl FakeNotifier {
        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn deliver(&self, subject: &str, _sender: &str) -> Result<(), NotifyError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(NotifyError::Status(
                    reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                ));
            }
            self.delivered.lock().unwrap().push(subject.to_string());
            Ok(())
        }
    }

    fn test_config(batch_size: usize) -> BridgeConfig {
        BridgeConfig {
            imap_host: "imap.test.example".to_string(),
            imap_port: 993,
            imap_username: "user".to_string(),
            imap_password: "pass".to_string(),
            imap_use_ssl: true,
            folders: vec!["INBOX".to_string()],
            check_interval: Duration::from_secs(60),
            batch_size,
            ntfy_topic: "https://ntfy.example/mail".to_string(),
            ntfy_title: String::new(),
            ntfy_icon: String::new(),
            ntfy_priority: 3,
            database_path: ":memory:".to_string(),
        }
    }

    async fn test_bridge(
        batch_size: usize,
    ) -> (Bridge<FakeConnector, FakeNotifier>, FakeConnector, FakeNotifier) {
        let connector = FakeConnector::default();
        let notifier = FakeNotifier::default();
        let ledger = Ledger::open_in_memory().await.unwrap();
        let bridge = Bridge::new(
            &test_config(batch_size),
            connector.clone(),
            notifier.clone(),
            ledger,
        );
        (bridge, connector, notifier)
    }

    #[tokio::test]
    async fn first_run_records_without_notifying() {
        let (mut bridge, connector, notifier) = test_bridge(50).await;
        connector.push(1, raw_header("<m1@x>", "Old mail", "a@b.com"));
        connector.push(2, raw_header("<m2@x>", "Older mail", "c@d.com"));

        bridge.first_run = bridge.ledger.is_empty().await.unwrap();
        assert!(bridge.first_run);
        bridge.run_cycle().await;

        assert!(notifier.delivered().is_empty());
        assert!(bridge.ledger.contains("<m1@x>").await.unwrap());
        assert!(bridge.ledger.contains("<m2@x>").await.unwrap());
        assert!(!bridge.first_run);
    }

    #[tokio::test]
    async fn new_message_after_first_run_is_notified_once() {
        let (mut bridge, connector, notifier) = test_bridge(50).await;
        connector.push(1, raw_header("<m1@x>", "Old mail", "a@b.com"));

        bridge.first_run = bridge.ledger.is_empty().await.unwrap();
        bridge.run_cycle().await;
        assert!(notifier.delivered().is_empty());

        // New mail arrives; the old one is still unseen on the server.
        connector.push(2, raw_header("<m2@x>", "Fresh mail", "c@d.com"));
        bridge.run_cycle().await;
        assert_eq!(notifier.delivered(), vec!["Fresh mail"]);

        // A further cycle with the same unseen set notifies nothing new.
        bridge.run_cycle().await;
        assert_eq!(notifier.delivered(), vec!["Fresh mail"]);
    }

    #[tokio::test]
    async fn delivery_failure_leaves_message_unrecorded_and_retries() {
        let (mut bridge, connector, notifier) = test_bridge(50).await;
        connector.push(1, raw_header("<m1@x>", "Important", "a@b.com"));
        bridge.first_run = false;

        notifier.fail.store(true, Ordering::Relaxed);
        bridge.run_cycle().await;
        assert!(notifier.delivered().is_empty());
        assert!(!bridge.ledger.contains("<m1@x>").await.unwrap());

        notifier.fail.store(false, Ordering::Relaxed);
        bridge.run_cycle().await;
        assert_eq!(notifier.delivered(), vec!["Important"]);
        assert!(bridge.ledger.contains("<m1@x>").await.unwrap());
    }

    #[tokio::test]
    async fn message_without_id_is_skipped_entirely() {
        let (mut bridge, connector, notifier) = test_bridge(50).await;
        connector.push(1, header_without_message_id());
        bridge.first_run = false;

        bridge.run_cycle().await;

        assert!(notifier.delivered().is_empty());
        assert!(bridge.ledger.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn batches_cover_all_ids_exactly_once() {
        let (mut bridge, connector, notifier) = test_bridge(2).await;
        for id in 1..=5u32 {
            connector.push(id, raw_header(&format!("<m{id}@x>"), &format!("Mail {id}"), "a@b.com"));
        }
        bridge.first_run = false;

        bridge.run_cycle().await;

        let calls = connector.fetch_calls();
        assert_eq!(calls, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(notifier.delivered().len(), 5);
    }

    #[tokio::test]
    async fn shutdown_stops_run_promptly() {
        let (mut bridge, _connector, _notifier) = test_bridge(50).await;
        bridge.shutdown_handle().trigger();

        tokio::time::timeout(Duration::from_secs(5), bridge.run())
            .await
            .expect("run did not stop after shutdown")
            .unwrap();
    }
}
