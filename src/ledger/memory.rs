//! In-process ledger
//!
//! Stands in for the document store in the binary and in tests. Each collection
//! sits behind its own lock; every conditional update checks and applies under a
//! single write lock, so it is atomic per document. Transport faults can be
//! injected to exercise the callers' retry paths.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{
    AuditEvent, Error, Holding, Ledger, Money, Result, Settlement, SettlementMode, Shares, Side,
    TransactionRecord, Trigger, TriggerKey, User,
};

#[derive(Default)]
pub struct MemoryLedger {
    users: RwLock<HashMap<String, User>>,
    triggers: RwLock<BTreeMap<TriggerKey, Trigger>>,
    transactions: RwLock<Vec<TransactionRecord>>,
    events: RwLock<Vec<AuditEvent>>,
    user_reads: AtomicUsize,
    faults: AtomicUsize,
    read_delay: Mutex<Duration>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with `Error::Unavailable` before touching any data
    pub fn fail_next(&self, n: usize) {
        self.faults.store(n, Ordering::SeqCst);
    }

    /// Number of `get_user` calls that reached the ledger
    pub fn user_reads(&self) -> usize {
        self.user_reads.load(Ordering::SeqCst)
    }

    /// Hold every `get_user` answer for `delay` after the document is read
    pub fn delay_user_reads(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    fn transport(&self, op: &str) -> Result<()> {
        let faulted = self
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if faulted {
            return Err(Error::Unavailable(format!("injected fault on {}", op)));
        }
        Ok(())
    }

    fn update_user<F>(&self, user_id: &str, apply: F) -> Result<User>
    where
        F: FnOnce(&mut User) -> Result<()>,
    {
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;
        apply(user)?;
        Ok(user.clone())
    }
}

fn conflict(what: String) -> Error {
    Error::Conflict(what)
}

/// `value + amount`, or a conflict when the column would overflow
fn credit(user_id: &str, value: i64, amount: i64) -> Result<i64> {
    value
        .checked_add(amount)
        .ok_or_else(|| conflict(format!("{} cannot take {} more on top of {}", user_id, amount, value)))
}

/// Check the settlement's precondition, then apply it. Leaves `user` untouched on error.
fn apply_settlement(user: &mut User, s: &Settlement, mode: SettlementMode) -> Result<()> {
    let holding = user.holding(&s.symbol);
    let (mut balance, mut reserved) = (user.balance, user.reserved);
    let (mut real, mut held) = (holding.real, holding.reserved);

    match (s.side, mode) {
        (Side::Buy, SettlementMode::Intent) => {
            if balance < s.amount {
                return Err(conflict(format!("{} balance {} < cost {}", user.id, balance, s.amount)));
            }
            balance -= s.amount;
            real = credit(&user.id, real, s.shares)?;
        }
        (Side::Buy, SettlementMode::Reserved) => {
            if reserved < s.reserved || s.reserved < s.amount {
                return Err(conflict(format!(
                    "{} reserved {} cannot cover budget {} / cost {}",
                    user.id, reserved, s.reserved, s.amount
                )));
            }
            reserved -= s.reserved;
            balance = credit(&user.id, balance, s.reserved - s.amount)?;
            real = credit(&user.id, real, s.shares)?;
        }
        (Side::Sell, SettlementMode::Intent) => {
            if real < s.shares {
                return Err(conflict(format!("{} holds {} {} < {}", user.id, real, s.symbol, s.shares)));
            }
            balance = credit(&user.id, balance, s.amount)?;
            real -= s.shares;
        }
        (Side::Sell, SettlementMode::Reserved) => {
            if held < s.shares {
                return Err(conflict(format!("{} reserved {} {} < {}", user.id, held, s.symbol, s.shares)));
            }
            balance = credit(&user.id, balance, s.amount)?;
            held -= s.shares;
        }
    }

    user.balance = balance;
    user.reserved = reserved;
    if real == 0 && held == 0 {
        user.holdings.remove(&s.symbol);
    } else {
        user.holdings.insert(s.symbol.clone(), Holding { real, reserved: held });
    }
    Ok(())
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get_user(&self, user_id: &str) -> Result<User> {
        self.transport("get_user")?;
        self.user_reads.fetch_add(1, Ordering::SeqCst);
        let found = self
            .users
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)));
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        found
    }

    async fn add_user_money(&self, user_id: &str, amount: Money) -> Result<User> {
        self.transport("add_user_money")?;
        let mut users = self.users.write();
        match users.get_mut(user_id) {
            Some(user) => {
                user.balance = credit(user_id, user.balance, amount)?;
                Ok(user.clone())
            }
            None => {
                let mut user = User::new(user_id);
                user.balance = amount;
                users.insert(user_id.to_string(), user.clone());
                Ok(user)
            }
        }
    }

    async fn reserve_money(&self, user_id: &str, amount: Money) -> Result<User> {
        self.transport("reserve_money")?;
        self.update_user(user_id, |user| {
            if user.balance < amount {
                return Err(conflict(format!("{} balance {} < {}", user_id, user.balance, amount)));
            }
            user.reserved = credit(user_id, user.reserved, amount)?;
            user.balance -= amount;
            Ok(())
        })
    }

    async fn unreserve_money(&self, user_id: &str, amount: Money) -> Result<User> {
        self.transport("unreserve_money")?;
        self.update_user(user_id, |user| {
            if user.reserved < amount {
                return Err(conflict(format!("{} reserved {} < {}", user_id, user.reserved, amount)));
            }
            user.balance = credit(user_id, user.balance, amount)?;
            user.reserved -= amount;
            Ok(())
        })
    }

    async fn reserve_shares(&self, user_id: &str, symbol: &str, shares: Shares) -> Result<User> {
        self.transport("reserve_shares")?;
        self.update_user(user_id, |user| {
            let holding = user.holding(symbol);
            if holding.real < shares {
                return Err(conflict(format!("{} holds {} {} < {}", user_id, holding.real, symbol, shares)));
            }
            let reserved = credit(user_id, holding.reserved, shares)?;
            let entry = user.holdings.entry(symbol.to_string()).or_default();
            entry.real -= shares;
            entry.reserved = reserved;
            Ok(())
        })
    }

    async fn unreserve_shares(&self, user_id: &str, symbol: &str, shares: Shares) -> Result<User> {
        self.transport("unreserve_shares")?;
        self.update_user(user_id, |user| {
            let holding = user.holding(symbol);
            if holding.reserved < shares {
                return Err(conflict(format!(
                    "{} reserved {} {} < {}",
                    user_id, holding.reserved, symbol, shares
                )));
            }
            let real = credit(user_id, holding.real, shares)?;
            let entry = user.holdings.entry(symbol.to_string()).or_default();
            entry.reserved -= shares;
            entry.real = real;
            Ok(())
        })
    }

    async fn settle(&self, settlement: &Settlement, mode: SettlementMode) -> Result<User> {
        self.transport("settle")?;
        self.update_user(&settlement.user_id, |user| apply_settlement(user, settlement, mode))
    }

    async fn bulk_settle(&self, settlements: &[Settlement], mode: SettlementMode) -> Result<Vec<bool>> {
        self.transport("bulk_settle")?;
        let mut users = self.users.write();
        Ok(settlements
            .iter()
            .map(|s| match users.get_mut(&s.user_id) {
                Some(user) => apply_settlement(user, s, mode).is_ok(),
                None => false,
            })
            .collect())
    }

    async fn set_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.transport("set_trigger")?;
        self.triggers.write().insert(trigger.key(), trigger.clone());
        Ok(())
    }

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Trigger> {
        self.transport("get_trigger")?;
        self.triggers
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("trigger {}", key)))
    }

    async fn cancel_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.transport("cancel_trigger")?;
        Ok(self.triggers.write().remove(key))
    }

    async fn user_triggers(&self, user_id: &str) -> Result<Vec<Trigger>> {
        self.transport("user_triggers")?;
        Ok(self
            .triggers
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn armed_triggers(&self) -> Result<Vec<Trigger>> {
        self.transport("armed_triggers")?;
        Ok(self
            .triggers
            .read()
            .values()
            .filter(|t| t.is_armed())
            .cloned()
            .collect())
    }

    async fn remove_triggers(&self, keys: &[TriggerKey]) -> Result<()> {
        self.transport("remove_triggers")?;
        let mut triggers = self.triggers.write();
        for key in keys {
            triggers.remove(key);
        }
        Ok(())
    }

    async fn append_transaction(&self, record: &TransactionRecord) -> Result<()> {
        self.transport("append_transaction")?;
        self.transactions.write().push(record.clone());
        Ok(())
    }

    async fn bulk_append_transactions(&self, records: &[TransactionRecord]) -> Result<()> {
        self.transport("bulk_append_transactions")?;
        self.transactions.write().extend_from_slice(records);
        Ok(())
    }

    async fn transactions(&self, user_id: &str) -> Result<Vec<TransactionRecord>> {
        self.transport("transactions")?;
        Ok(self
            .transactions
            .read()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn append_events(&self, events: &[AuditEvent]) -> Result<()> {
        self.transport("append_events")?;
        self.events.write().extend_from_slice(events);
        Ok(())
    }

    async fn query_events(&self, user_id: Option<&str>) -> Result<Vec<AuditEvent>> {
        self.transport("query_events")?;
        let events = self.events.read();
        Ok(match user_id {
            Some(id) => events.iter().filter(|e| e.user_id == id).cloned().collect(),
            None => events.clone(),
        })
    }
}
