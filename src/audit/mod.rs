//! Audit log - fire-and-forget event records with a background writer
//!
//! Callers enqueue onto a bounded `flume` channel and never wait. A single writer
//! task drains the queue in batches and persists them through the ledger, retrying
//! until they land. Dumps flush the queue first so they include everything
//! recorded before the call.

use async_trait::async_trait;
use chrono::Utc;
use flume::TrySendError;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::core::config::AuditConfig;
use crate::core::{
    AccountAction, AuditEvent, AuditSink, Command, CommandEnvelope, Error, EventDetail, Ledger, Money, Quote,
    Result, format_money,
};

enum Job {
    Record(AuditEvent),
    Flush(oneshot::Sender<()>),
}

pub struct AuditLog {
    server: String,
    queue: flume::Sender<Job>,
    ledger: Arc<dyn Ledger>,
}

impl AuditLog {
    /// Start the writer task and return the handle callers record through.
    /// The writer exits once every handle is dropped and the queue is drained.
    pub fn spawn(ledger: Arc<dyn Ledger>, server: impl Into<String>, config: &AuditConfig) -> Self {
        let (queue, jobs) = flume::bounded(config.queue_capacity.max(1));
        tokio::spawn(run_writer(jobs, Arc::clone(&ledger), config.clone()));
        Self {
            server: server.into(),
            queue,
            ledger,
        }
    }

    /// Wait until everything enqueued so far has been persisted
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.queue
            .send_async(Job::Flush(done))
            .await
            .map_err(|_| Error::Audit("audit writer stopped".to_string()))?;
        wait.await
            .map_err(|_| Error::Audit("audit writer dropped flush".to_string()))
    }

    fn record(&self, user_id: &str, transaction_num: i64, detail: EventDetail) {
        let event = AuditEvent {
            timestamp: Utc::now().timestamp_millis(),
            server: self.server.clone(),
            transaction_num,
            user_id: user_id.to_string(),
            detail,
        };
        match self.queue.try_send(Job::Record(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::warn!("⚠️ audit queue full, event dropped"),
            Err(TrySendError::Disconnected(_)) => tracing::warn!("audit writer gone, event dropped"),
        }
    }

    async fn dump(&self, user_id: Option<&str>) -> Result<Vec<u8>> {
        self.flush().await?;
        let events = self.ledger.query_events(user_id).await?;
        tracing::info!("📜 dumping {} audit events", events.len());
        Ok(serde_json::to_vec_pretty(&events)?)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn funds(cmd: &Command) -> Option<Money> {
    (cmd.amount != 0).then_some(cmd.amount)
}

#[async_trait]
impl AuditSink for AuditLog {
    fn user_command(&self, cmd: &Command) {
        self.record(
            &cmd.user_id,
            cmd.transaction_id,
            EventDetail::UserCommand {
                command: cmd.kind.as_str().to_string(),
                symbol: non_empty(&cmd.symbol),
                filename: non_empty(&cmd.filename),
                funds: funds(cmd),
            },
        );
    }

    fn quote_server(&self, quote: &Quote, transaction_num: i64) {
        self.record(
            &quote.user_id,
            transaction_num,
            EventDetail::QuoteServer {
                price: format_money(quote.price),
                symbol: quote.symbol.clone(),
                quote_server_time: quote.timestamp,
                cryptokey: quote.cryptokey.clone(),
            },
        );
    }

    fn account_transaction(&self, user_id: &str, transaction_num: i64, action: AccountAction, funds: Money) {
        self.record(user_id, transaction_num, EventDetail::AccountTransaction { action, funds });
    }

    fn system_event(&self, cmd: &Command) {
        self.record(
            &cmd.user_id,
            cmd.transaction_id,
            EventDetail::SystemEvent {
                command: cmd.kind.as_str().to_string(),
                symbol: non_empty(&cmd.symbol),
                funds: funds(cmd),
            },
        );
    }

    fn error_event(&self, cmd: &Command, message: &str) {
        self.record(
            &cmd.user_id,
            cmd.transaction_id,
            EventDetail::ErrorEvent {
                command: cmd.kind.as_str().to_string(),
                symbol: non_empty(&cmd.symbol),
                funds: funds(cmd),
                error_message: message.to_string(),
            },
        );
    }

    fn request_error(&self, envelope: &CommandEnvelope, message: &str) {
        self.record(
            envelope.user_id.trim(),
            envelope.transaction_id,
            EventDetail::ErrorEvent {
                command: format!("KIND_{}", envelope.kind),
                symbol: non_empty(envelope.stock_symbol.trim()),
                funds: (envelope.amount != 0).then_some(envelope.amount),
                error_message: message.to_string(),
            },
        );
    }

    fn debug_event(&self, cmd: &Command, message: &str) {
        self.record(
            &cmd.user_id,
            cmd.transaction_id,
            EventDetail::DebugEvent {
                command: cmd.kind.as_str().to_string(),
                symbol: non_empty(&cmd.symbol),
                funds: funds(cmd),
                debug_message: message.to_string(),
            },
        );
    }

    async fn dump_log_user(&self, user_id: &str) -> Result<Vec<u8>> {
        self.dump(Some(user_id)).await
    }

    async fn dump_log(&self) -> Result<Vec<u8>> {
        self.dump(None).await
    }
}

async fn run_writer(jobs: flume::Receiver<Job>, ledger: Arc<dyn Ledger>, config: AuditConfig) {
    let batch_size = config.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut waiters = Vec::new();

    while let Ok(job) = jobs.recv_async().await {
        let mut next = Some(job);
        while let Some(job) = next.take() {
            match job {
                Job::Record(event) => batch.push(event),
                Job::Flush(done) => waiters.push(done),
            }
            if batch.len() < batch_size {
                next = jobs.try_recv().ok();
            }
        }

        if !batch.is_empty() {
            persist(ledger.as_ref(), &batch, &config).await;
            batch.clear();
        }
        for done in waiters.drain(..) {
            let _ = done.send(());
        }
    }
    tracing::debug!("audit writer stopped");
}

/// Retry without limit; audit events are never discarded once dequeued
async fn persist(ledger: &dyn Ledger, batch: &[AuditEvent], config: &AuditConfig) {
    let mut backoff = config.retry_backoff();
    loop {
        match ledger.append_events(batch).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!("audit append of {} events failed, retrying in {:?}: {}", batch.len(), backoff, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff());
            }
        }
    }
}
