//! Entity cache - read-through, write-invalidate cache over users and triggers
//!
//! Absent entities are remembered too (negative cache) so repeated lookups of an
//! unknown id do not reach the ledger. All access to one key is serialized by its
//! own lock; a write refreshes the positive entry and clears any tombstone.
//! Every ledger call is retried on transport failure until the caller deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{KeyGuard, KeyedLocks, TtlCache};
use crate::core::config::LedgerConfig;
use crate::core::{
    Error, Ledger, Money, Result, Settlement, SettlementMode, Shares, TransactionRecord, Trigger,
    TriggerKey, User,
};

pub struct EntityCache {
    ledger: Arc<dyn Ledger>,
    users: TtlCache<String, User>,
    missing_users: TtlCache<String, ()>,
    triggers: TtlCache<TriggerKey, Trigger>,
    missing_triggers: TtlCache<TriggerKey, ()>,
    user_locks: KeyedLocks<String>,
    trigger_locks: KeyedLocks<TriggerKey>,
    trigger_claims: KeyedLocks<TriggerKey>,
    timeout: Duration,
    backoff: Duration,
}

impl EntityCache {
    pub fn new(ledger: Arc<dyn Ledger>, ttl: Duration, config: &LedgerConfig) -> Self {
        Self {
            ledger,
            users: TtlCache::new(ttl),
            missing_users: TtlCache::new(ttl),
            triggers: TtlCache::new(ttl),
            missing_triggers: TtlCache::new(ttl),
            user_locks: KeyedLocks::new(),
            trigger_locks: KeyedLocks::new(),
            trigger_claims: KeyedLocks::new(),
            timeout: config.timeout(),
            backoff: config.retry_backoff(),
        }
    }

    /// Run a ledger call, resending on transport failure until the deadline
    async fn retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = async {
            let mut backoff = self.backoff;
            loop {
                match call().await {
                    Err(e) if e.is_transient() => {
                        tracing::debug!("ledger {} failed ({}), retrying in {:?}", what, e, backoff);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.timeout);
                    }
                    other => return other,
                }
            }
        };
        tokio::time::timeout(self.timeout, attempts)
            .await
            .map_err(|_| Error::Timeout(format!("ledger {} exceeded {:?}", what, self.timeout)))?
    }

    // ─────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────

    pub async fn get_user(&self, user_id: &str) -> Result<User> {
        let _guard = self.user_locks.lock(user_id.to_string()).await;
        if let Some(user) = self.users.get(user_id) {
            return Ok(user);
        }
        if self.missing_users.contains(user_id) {
            return Err(Error::NotFound(format!("user {}", user_id)));
        }

        match self.retry("get_user", || self.ledger.get_user(user_id)).await {
            Ok(user) => {
                self.users.insert(user_id.to_string(), user.clone());
                Ok(user)
            }
            Err(Error::NotFound(what)) => {
                self.missing_users.insert(user_id.to_string(), ());
                Err(Error::NotFound(what))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a user mutation under the user's lock and refresh the cache with the result
    async fn write_user<F, Fut>(&self, user_id: &str, what: &str, call: F) -> Result<User>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<User>>,
    {
        let _guard = self.user_locks.lock(user_id.to_string()).await;
        match self.retry(what, call).await {
            Ok(user) => {
                self.missing_users.remove(user_id);
                self.users.insert(user_id.to_string(), user.clone());
                Ok(user)
            }
            Err(e) => {
                self.users.remove(user_id);
                Err(e)
            }
        }
    }

    pub async fn add_user_money(&self, user_id: &str, amount: Money) -> Result<User> {
        self.write_user(user_id, "add_user_money", || self.ledger.add_user_money(user_id, amount))
            .await
    }

    pub async fn reserve_money(&self, user_id: &str, amount: Money) -> Result<User> {
        self.write_user(user_id, "reserve_money", || self.ledger.reserve_money(user_id, amount))
            .await
    }

    pub async fn unreserve_money(&self, user_id: &str, amount: Money) -> Result<User> {
        self.write_user(user_id, "unreserve_money", || self.ledger.unreserve_money(user_id, amount))
            .await
    }

    pub async fn reserve_shares(&self, user_id: &str, symbol: &str, shares: Shares) -> Result<User> {
        self.write_user(user_id, "reserve_shares", || {
            self.ledger.reserve_shares(user_id, symbol, shares)
        })
        .await
    }

    pub async fn unreserve_shares(&self, user_id: &str, symbol: &str, shares: Shares) -> Result<User> {
        self.write_user(user_id, "unreserve_shares", || {
            self.ledger.unreserve_shares(user_id, symbol, shares)
        })
        .await
    }

    pub async fn settle(&self, settlement: &Settlement, mode: SettlementMode) -> Result<User> {
        self.write_user(&settlement.user_id, "settle", || self.ledger.settle(settlement, mode))
            .await
    }

    /// Uncached; every user touched by the batch is locked, then invalidated
    pub async fn bulk_settle(&self, settlements: &[Settlement], mode: SettlementMode) -> Result<Vec<bool>> {
        let _guards = self
            .user_locks
            .lock_all(settlements.iter().map(|s| s.user_id.clone()))
            .await;
        let result = self
            .retry("bulk_settle", || self.ledger.bulk_settle(settlements, mode))
            .await;
        for s in settlements {
            self.users.remove(&s.user_id);
        }
        result
    }

    // ─────────────────────────────────────────────────────────
    // Triggers
    // ─────────────────────────────────────────────────────────

    pub async fn get_trigger(&self, key: &TriggerKey) -> Result<Trigger> {
        let _guard = self.trigger_locks.lock(key.clone()).await;
        if let Some(trigger) = self.triggers.get(key) {
            return Ok(trigger);
        }
        if self.missing_triggers.contains(key) {
            return Err(Error::NotFound(format!("trigger {}", key)));
        }

        match self.retry("get_trigger", || self.ledger.get_trigger(key)).await {
            Ok(trigger) => {
                self.triggers.insert(key.clone(), trigger.clone());
                Ok(trigger)
            }
            Err(Error::NotFound(what)) => {
                self.missing_triggers.insert(key.clone(), ());
                Err(Error::NotFound(what))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn set_trigger(&self, trigger: &Trigger) -> Result<()> {
        let key = trigger.key();
        let _guard = self.trigger_locks.lock(key.clone()).await;
        match self.retry("set_trigger", || self.ledger.set_trigger(trigger)).await {
            Ok(()) => {
                self.missing_triggers.remove(&key);
                self.triggers.insert(key, trigger.clone());
                Ok(())
            }
            Err(e) => {
                self.triggers.remove(&key);
                Err(e)
            }
        }
    }

    pub async fn cancel_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let _guard = self.trigger_locks.lock(key.clone()).await;
        let result = self.retry("cancel_trigger", || self.ledger.cancel_trigger(key)).await;
        self.triggers.remove(key);
        if result.is_ok() {
            self.missing_triggers.insert(key.clone(), ());
        }
        result
    }

    pub async fn remove_triggers(&self, keys: &[TriggerKey]) -> Result<()> {
        let _guards = self.trigger_locks.lock_all(keys.iter().cloned()).await;
        let result = self
            .retry("remove_triggers", || self.ledger.remove_triggers(keys))
            .await;
        for key in keys {
            self.triggers.remove(key);
            self.missing_triggers.remove(key);
        }
        result
    }

    /// Hold a trigger steady across a multi-step change such as set-amount or
    /// settle-then-remove. Independent of the per-call locks, so the holder can
    /// still read and write the trigger.
    pub async fn claim_trigger(&self, key: &TriggerKey) -> KeyGuard<TriggerKey> {
        self.trigger_claims.lock(key.clone()).await
    }

    pub async fn claim_triggers(&self, keys: impl IntoIterator<Item = TriggerKey>) -> Vec<KeyGuard<TriggerKey>> {
        self.trigger_claims.lock_all(keys).await
    }

    pub async fn user_triggers(&self, user_id: &str) -> Result<Vec<Trigger>> {
        self.retry("user_triggers", || self.ledger.user_triggers(user_id)).await
    }

    pub async fn armed_triggers(&self) -> Result<Vec<Trigger>> {
        self.retry("armed_triggers", || self.ledger.armed_triggers()).await
    }

    // ─────────────────────────────────────────────────────────
    // History
    // ─────────────────────────────────────────────────────────

    pub async fn append_transaction(&self, record: &TransactionRecord) -> Result<()> {
        self.retry("append_transaction", || self.ledger.append_transaction(record))
            .await
    }

    pub async fn bulk_append_transactions(&self, records: &[TransactionRecord]) -> Result<()> {
        self.retry("bulk_append_transactions", || {
            self.ledger.bulk_append_transactions(records)
        })
        .await
    }

    pub async fn transactions(&self, user_id: &str) -> Result<Vec<TransactionRecord>> {
        self.retry("transactions", || self.ledger.transactions(user_id)).await
    }
}
