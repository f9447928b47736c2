//! Core traits - Collaborator boundaries the engine is written against

use async_trait::async_trait;

use crate::core::{Result, types::*};

/// Persistent document store: Users, Triggers, Transactions and EventLogs.
///
/// Every mutation is atomic per document. A failed precondition is reported as
/// `Error::Conflict`, a missing document as `Error::NotFound`, and a transport
/// failure as `Error::Unavailable` (the only kind callers may resend).
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<User>;

    /// Credit the balance, creating the user if absent
    async fn add_user_money(&self, user_id: &str, amount: Money) -> Result<User>;

    /// Move cash from balance to reserved, conditional on `balance >= amount`
    async fn reserve_money(&self, user_id: &str, amount: Money) -> Result<User>;

    /// Move cash back from reserved to balance, conditional on `reserved >= amount`
    async fn unreserve_money(&self, user_id: &str, amount: Money) -> Result<User>;

    /// Move shares from real to reserved, conditional on `real >= shares`
    async fn reserve_shares(&self, user_id: &str, symbol: &str, shares: Shares) -> Result<User>;

    /// Move shares back from reserved to real, conditional on `reserved >= shares`
    async fn unreserve_shares(&self, user_id: &str, symbol: &str, shares: Shares) -> Result<User>;

    /// Apply one money-for-shares transfer atomically
    async fn settle(&self, settlement: &Settlement, mode: SettlementMode) -> Result<User>;

    /// Apply many transfers; the returned flags say which ones matched their condition
    async fn bulk_settle(&self, settlements: &[Settlement], mode: SettlementMode) -> Result<Vec<bool>>;

    /// Upsert by (user, symbol, side)
    async fn set_trigger(&self, trigger: &Trigger) -> Result<()>;

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Trigger>;

    /// Remove and return the trigger, `None` if there was nothing to remove
    async fn cancel_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;

    async fn user_triggers(&self, user_id: &str) -> Result<Vec<Trigger>>;

    /// Triggers whose threshold is set (`when > 0`)
    async fn armed_triggers(&self) -> Result<Vec<Trigger>>;

    async fn remove_triggers(&self, keys: &[TriggerKey]) -> Result<()>;

    async fn append_transaction(&self, record: &TransactionRecord) -> Result<()>;

    async fn bulk_append_transactions(&self, records: &[TransactionRecord]) -> Result<()>;

    async fn transactions(&self, user_id: &str) -> Result<Vec<TransactionRecord>>;

    async fn append_events(&self, events: &[AuditEvent]) -> Result<()>;

    /// One user's events, or every event when `user_id` is `None`
    async fn query_events(&self, user_id: Option<&str>) -> Result<Vec<AuditEvent>>;
}

/// Live price feed
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, symbol: &str, user_id: &str) -> Result<Quote>;

    fn name(&self) -> &str;
}

/// Audit sink.
///
/// Recording methods never block the caller and never fail; dumps wait for
/// everything queued so far to be persisted.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn user_command(&self, cmd: &Command);

    fn quote_server(&self, quote: &Quote, transaction_num: i64);

    fn account_transaction(&self, user_id: &str, transaction_num: i64, action: AccountAction, funds: Money);

    fn system_event(&self, cmd: &Command);

    fn error_event(&self, cmd: &Command, message: &str);

    /// A request that decoded but never became a command
    fn request_error(&self, envelope: &CommandEnvelope, message: &str);

    fn debug_event(&self, cmd: &Command, message: &str);

    /// Serialized log for one user
    async fn dump_log_user(&self, user_id: &str) -> Result<Vec<u8>>;

    /// Serialized system-wide log
    async fn dump_log(&self) -> Result<Vec<u8>>;
}
