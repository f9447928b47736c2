//! Transaction state machine - one handler per command kind
//!
//! Handlers are stateless: everything they know comes from the caches, the
//! ledger, and the command. BUY/SELL only push an intent into the reservation
//! cache; COMMIT settles it against the ledger, which re-checks the balance or
//! shares atomically. SET_*_AMOUNT reserves on the ledger up front so a trigger
//! firing later can never overdraw.

use chrono::Utc;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::{EntityCache, QuoteCache, ReservationCache};
use crate::core::{
    AccountAction, AccountSnapshot, AuditSink, Command, Error, Money, PendingReservation, Quote,
    Response, Settlement, SettlementMode, Shares, Side, TransactionRecord, Trigger, TriggerKey,
    User,
};
use crate::engine::Rejection;

/// User id whose DUMPLOG returns the system-wide log
pub const ADMIN_USER: &str = "admin";

pub type Outcome<T = Response> = std::result::Result<T, Rejection>;

pub struct TransactionEngine {
    entities: Arc<EntityCache>,
    quotes: Arc<QuoteCache>,
    reservations: Arc<ReservationCache>,
    audit: Arc<dyn AuditSink>,
    intent_lifetime: chrono::Duration,
}

impl TransactionEngine {
    pub fn new(
        entities: Arc<EntityCache>,
        quotes: Arc<QuoteCache>,
        reservations: Arc<ReservationCache>,
        audit: Arc<dyn AuditSink>,
        intent_lifetime: chrono::Duration,
    ) -> Self {
        Self {
            entities,
            quotes,
            reservations,
            audit,
            intent_lifetime,
        }
    }

    // ─────────────────────────────────────────────────────────
    // Funding and quotes
    // ─────────────────────────────────────────────────────────

    pub async fn add(&self, cmd: &Command) -> Outcome {
        let user = self
            .entities
            .add_user_money(&cmd.user_id, cmd.amount)
            .await
            .map_err(|e| match e {
                Error::Conflict(_) => Rejection::business("Failed to add money to account"),
                e => e.into(),
            })?;
        self.audit
            .account_transaction(&cmd.user_id, cmd.transaction_id, AccountAction::Add, cmd.amount);
        info!("💰 {} +{} (balance {})", cmd.user_id, cmd.amount, user.balance);
        Ok(Response::ok())
    }

    pub async fn quote(&self, cmd: &Command) -> Outcome {
        let quote = self.live_quote(cmd).await?;
        Ok(Response {
            quote: Some(quote.price),
            symbol: Some(quote.symbol),
            ..Response::ok()
        })
    }

    // ─────────────────────────────────────────────────────────
    // Two-phase BUY
    // ─────────────────────────────────────────────────────────

    pub async fn buy(&self, cmd: &Command) -> Outcome {
        let user = self.existing_user(&cmd.user_id).await?;
        let available = user.balance - self.reservations.reserved_money(&cmd.user_id);
        if cmd.amount > available {
            return Err(Rejection::business("Specified amount is greater than can afford"));
        }

        let quote = self.live_quote(cmd).await?;
        let shares = cmd.amount / quote.price;
        if shares == 0 {
            return Err(Rejection::business("Specified amount is not enough to purchase any shares"));
        }

        let cost = shares * quote.price;
        let expiry = Utc::now() + self.intent_lifetime;
        self.reservations.push(PendingReservation {
            user_id: cmd.user_id.clone(),
            side: Side::Buy,
            symbol: cmd.symbol.clone(),
            shares,
            amount: cost,
            // The whole request is held back until commit or expiry
            reserved: cmd.amount,
            expiry,
        });
        debug!("{} intends to buy {} {} for {}", cmd.user_id, shares, cmd.symbol, cost);

        Ok(Response {
            requested_amount: Some(cmd.amount),
            real_amount: Some(cost),
            shares: Some(shares),
            expiration: Some(expiry.timestamp()),
            ..Response::ok()
        })
    }

    pub async fn commit_buy(&self, cmd: &Command) -> Outcome {
        let pending = self
            .reservations
            .pop(&cmd.user_id, Side::Buy)
            .ok_or_else(|| Rejection::business("There are no pending transactions"))?;
        let settlement = Settlement::from(&pending);

        match self.entities.settle(&settlement, SettlementMode::Intent).await {
            Ok(_) => {}
            Err(Error::Conflict(_) | Error::NotFound(_)) => {
                return Err(Rejection::business("User can no longer afford this purchase"));
            }
            Err(e) => return Err(e.into()),
        }
        self.audit.account_transaction(
            &cmd.user_id,
            cmd.transaction_id,
            AccountAction::Remove,
            settlement.amount,
        );
        self.record_history(cmd, &settlement).await;
        info!("✅ {} bought {} {} for {}", cmd.user_id, settlement.shares, settlement.symbol, settlement.amount);

        Ok(Response {
            symbol: Some(settlement.symbol),
            shares: Some(settlement.shares),
            paid: Some(settlement.amount),
            ..Response::ok()
        })
    }

    pub async fn cancel_buy(&self, cmd: &Command) -> Outcome {
        let pending = self
            .reservations
            .pop(&cmd.user_id, Side::Buy)
            .ok_or_else(|| Rejection::business("There is no buy to cancel"))?;
        debug!("{} dropped buy of {} {}", cmd.user_id, pending.shares, pending.symbol);
        Ok(Response {
            symbol: Some(pending.symbol),
            shares: Some(pending.shares),
            ..Response::ok()
        })
    }

    // ─────────────────────────────────────────────────────────
    // Two-phase SELL
    // ─────────────────────────────────────────────────────────

    pub async fn sell(&self, cmd: &Command) -> Outcome {
        let user = self.existing_user(&cmd.user_id).await?;
        let available = user.holding(&cmd.symbol).real - self.intent_shares(&cmd.user_id, &cmd.symbol);
        if available <= 0 {
            return Err(Rejection::business("User does not own any shares for that stock"));
        }

        let quote = self.live_quote(cmd).await?;
        let wanted = cmd.amount / quote.price;
        if wanted == 0 {
            return Err(Rejection::business("A single share is worth more than specified amount"));
        }

        let shares = wanted.min(available);
        let proceeds = shares * quote.price;
        let expiry = Utc::now() + self.intent_lifetime;
        self.reservations.push(PendingReservation {
            user_id: cmd.user_id.clone(),
            side: Side::Sell,
            symbol: cmd.symbol.clone(),
            shares,
            amount: proceeds,
            reserved: 0,
            expiry,
        });
        debug!("{} intends to sell {} {} for {}", cmd.user_id, shares, cmd.symbol, proceeds);

        Ok(Response {
            requested_amount: Some(cmd.amount),
            real_amount: Some(wanted * quote.price),
            shares: Some(wanted),
            shares_affordable: Some(shares),
            affordable_amount: Some(proceeds),
            expiration: Some(expiry.timestamp()),
            ..Response::ok()
        })
    }

    pub async fn commit_sell(&self, cmd: &Command) -> Outcome {
        let pending = self
            .reservations
            .pop(&cmd.user_id, Side::Sell)
            .ok_or_else(|| Rejection::business("There are no pending transactions"))?;
        let settlement = Settlement::from(&pending);

        match self.entities.settle(&settlement, SettlementMode::Intent).await {
            Ok(_) => {}
            Err(Error::Conflict(_) | Error::NotFound(_)) => {
                return Err(Rejection::business("User no longer has the correct number of shares to sell"));
            }
            Err(e) => return Err(e.into()),
        }
        self.audit.account_transaction(
            &cmd.user_id,
            cmd.transaction_id,
            AccountAction::Add,
            settlement.amount,
        );
        self.record_history(cmd, &settlement).await;
        info!("✅ {} sold {} {} for {}", cmd.user_id, settlement.shares, settlement.symbol, settlement.amount);

        Ok(Response {
            symbol: Some(settlement.symbol),
            shares: Some(settlement.shares),
            received: Some(settlement.amount),
            ..Response::ok()
        })
    }

    pub async fn cancel_sell(&self, cmd: &Command) -> Outcome {
        let pending = self
            .reservations
            .pop(&cmd.user_id, Side::Sell)
            .ok_or_else(|| Rejection::business("There is no sell to cancel"))?;
        debug!("{} dropped sell of {} {}", cmd.user_id, pending.shares, pending.symbol);
        Ok(Response {
            symbol: Some(pending.symbol),
            shares: Some(pending.shares),
            ..Response::ok()
        })
    }

    // ─────────────────────────────────────────────────────────
    // Conditional orders
    // ─────────────────────────────────────────────────────────

    /// Reserve a BUY budget on the ledger and park it in an unarmed trigger.
    /// Re-setting replaces the budget, moving only the difference.
    pub async fn set_buy_amount(&self, cmd: &Command) -> Outcome {
        let key = TriggerKey::new(&cmd.user_id, &cmd.symbol, Side::Buy);
        let _claim = self.entities.claim_trigger(&key).await;
        let user = self.existing_user(&cmd.user_id).await?;
        let existing = self.find_trigger(&key).await?;

        let held = existing.as_ref().map_or(0, |t| t.amount);
        let delta = cmd.amount - held;
        let available = user.balance - self.reservations.reserved_money(&cmd.user_id);
        if delta > available {
            return Err(Rejection::business("Not enough funds"));
        }

        // Symbol must be quotable before any money moves
        self.live_quote(cmd).await?;

        self.shift_reserved_money(&cmd.user_id, delta)
            .await
            .map_err(|e| match e {
                Error::Conflict(_) => Rejection::business("Not enough funds"),
                e => e.into(),
            })?;

        let trigger = Trigger {
            user_id: cmd.user_id.clone(),
            symbol: cmd.symbol.clone(),
            side: Side::Buy,
            transaction_id: cmd.transaction_id,
            shares: 0,
            amount: cmd.amount,
            when: 0,
        };
        if let Err(e) = self.entities.set_trigger(&trigger).await {
            if let Err(undo) = self.shift_reserved_money(&cmd.user_id, -delta).await {
                error!("❌ {} left {} reserved after failed trigger write: {}", cmd.user_id, delta, undo);
            }
            return Err(e.into());
        }

        match delta.cmp(&0) {
            Ordering::Greater => self.audit.account_transaction(
                &cmd.user_id,
                cmd.transaction_id,
                AccountAction::Reserve,
                delta,
            ),
            Ordering::Less => self.audit.account_transaction(
                &cmd.user_id,
                cmd.transaction_id,
                AccountAction::Unreserve,
                -delta,
            ),
            Ordering::Equal => {}
        }
        info!("🎯 {} BUY {} budget {}", cmd.user_id, cmd.symbol, cmd.amount);

        Ok(Response {
            symbol: Some(cmd.symbol.clone()),
            requested_amount: Some(cmd.amount),
            ..Response::ok()
        })
    }

    pub async fn cancel_set_buy(&self, cmd: &Command) -> Outcome {
        let key = TriggerKey::new(&cmd.user_id, &cmd.symbol, Side::Buy);
        let _claim = self.entities.claim_trigger(&key).await;
        let removed = self
            .entities
            .cancel_trigger(&key)
            .await?
            .ok_or_else(|| Rejection::business("No buy trigger to cancel"))?;

        if removed.amount > 0 {
            if let Err(e) = self.entities.unreserve_money(&cmd.user_id, removed.amount).await {
                self.restore_trigger(&key, Some(removed)).await;
                return Err(e.into());
            }
        }
        self.audit.account_transaction(
            &cmd.user_id,
            cmd.transaction_id,
            AccountAction::Unreserve,
            removed.amount,
        );
        info!("🗑️ {} BUY {} trigger cancelled, {} released", cmd.user_id, cmd.symbol, removed.amount);

        Ok(Response {
            symbol: Some(removed.symbol),
            ..Response::ok()
        })
    }

    pub async fn set_buy_trigger(&self, cmd: &Command) -> Outcome {
        self.arm_trigger(cmd, Side::Buy, "User must set buy amount first").await
    }

    /// Move shares into the ledger's reserved column and park them in an unarmed trigger
    pub async fn set_sell_amount(&self, cmd: &Command) -> Outcome {
        let key = TriggerKey::new(&cmd.user_id, &cmd.symbol, Side::Sell);
        let _claim = self.entities.claim_trigger(&key).await;
        let user = self.existing_user(&cmd.user_id).await?;
        let existing = self.find_trigger(&key).await?;

        let held = existing.as_ref().map_or(0, |t| t.shares);
        let available =
            user.holding(&cmd.symbol).real - self.intent_shares(&cmd.user_id, &cmd.symbol) + held;
        if available <= 0 {
            return Err(Rejection::business("The user does not have any stock"));
        }

        let quote = self.live_quote(cmd).await?;
        let wanted = cmd.amount / quote.price;
        if wanted == 0 {
            return Err(Rejection::business("A single share is worth more than specified amount"));
        }
        let shares = wanted.min(available);
        let delta = shares - held;

        let trigger = Trigger {
            user_id: cmd.user_id.clone(),
            symbol: cmd.symbol.clone(),
            side: Side::Sell,
            transaction_id: cmd.transaction_id,
            shares,
            amount: cmd.amount,
            when: 0,
        };
        self.entities.set_trigger(&trigger).await?;

        if let Err(e) = self.shift_reserved_shares(&cmd.user_id, &cmd.symbol, delta).await {
            self.restore_trigger(&key, existing).await;
            return Err(match e {
                Error::Conflict(_) => {
                    Rejection::business("User no longer has the correct number of shares to sell")
                }
                e => e.into(),
            });
        }

        self.audit.account_transaction(
            &cmd.user_id,
            cmd.transaction_id,
            AccountAction::Reserve,
            cmd.amount,
        );
        info!("🎯 {} SELL {} x{} for {}", cmd.user_id, cmd.symbol, shares, cmd.amount);

        Ok(Response {
            symbol: Some(cmd.symbol.clone()),
            requested_amount: Some(cmd.amount),
            shares: Some(shares),
            ..Response::ok()
        })
    }

    pub async fn set_sell_trigger(&self, cmd: &Command) -> Outcome {
        self.arm_trigger(cmd, Side::Sell, "User must set sell amount first").await
    }

    pub async fn cancel_set_sell(&self, cmd: &Command) -> Outcome {
        let key = TriggerKey::new(&cmd.user_id, &cmd.symbol, Side::Sell);
        let _claim = self.entities.claim_trigger(&key).await;
        let removed = self
            .entities
            .cancel_trigger(&key)
            .await?
            .ok_or_else(|| Rejection::business("No sell trigger to cancel"))?;

        if removed.shares > 0 {
            if let Err(e) = self
                .entities
                .unreserve_shares(&cmd.user_id, &cmd.symbol, removed.shares)
                .await
            {
                self.restore_trigger(&key, Some(removed)).await;
                return Err(e.into());
            }
        }
        self.audit.account_transaction(
            &cmd.user_id,
            cmd.transaction_id,
            AccountAction::Unreserve,
            removed.amount,
        );
        info!("🗑️ {} SELL {} trigger cancelled, {} shares released", cmd.user_id, cmd.symbol, removed.shares);

        Ok(Response {
            symbol: Some(removed.symbol),
            shares: Some(removed.shares),
            ..Response::ok()
        })
    }

    // ─────────────────────────────────────────────────────────
    // Reporting
    // ─────────────────────────────────────────────────────────

    pub async fn dump_log(&self, cmd: &Command) -> Outcome {
        if cmd.user_id == ADMIN_USER {
            return self.admin_dump_log(cmd).await;
        }
        self.existing_user(&cmd.user_id).await?;
        let file = self.audit.dump_log_user(&cmd.user_id).await?;
        Ok(Response {
            file: Some(file),
            ..Response::ok()
        })
    }

    pub async fn admin_dump_log(&self, _cmd: &Command) -> Outcome {
        let file = self.audit.dump_log().await?;
        Ok(Response {
            file: Some(file),
            ..Response::ok()
        })
    }

    pub async fn display_summary(&self, cmd: &Command) -> Outcome {
        let user = self.existing_user(&cmd.user_id).await?;
        let status = account_snapshot(
            &user,
            self.reservations.reserved_money(&cmd.user_id),
            &self.reservations.reserved_shares(&cmd.user_id),
        );
        let transactions = self.entities.transactions(&cmd.user_id).await?;
        let triggers = self.entities.user_triggers(&cmd.user_id).await?;

        Ok(Response {
            status: Some(status),
            transactions: Some(transactions),
            triggers: Some(triggers),
            ..Response::ok()
        })
    }

    // ─────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────

    async fn existing_user(&self, user_id: &str) -> Outcome<User> {
        match self.entities.get_user(user_id).await {
            Ok(user) => Ok(user),
            Err(Error::NotFound(_)) => Err(Rejection::business("The user does not exist")),
            Err(e) => Err(e.into()),
        }
    }

    async fn live_quote(&self, cmd: &Command) -> Outcome<Quote> {
        self.quotes
            .get_quote(&cmd.symbol, &cmd.user_id, cmd.transaction_id)
            .await
            .map_err(|e| {
                debug!("no quote for {}: {}", cmd.symbol, e);
                Rejection::business("Failed to get quote for that stock")
            })
    }

    async fn find_trigger(&self, key: &TriggerKey) -> Outcome<Option<Trigger>> {
        match self.entities.get_trigger(key).await {
            Ok(trigger) => Ok(Some(trigger)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// SET_*_TRIGGER: the trigger must exist and must not be armed yet
    async fn arm_trigger(&self, cmd: &Command, side: Side, missing: &str) -> Outcome {
        let key = TriggerKey::new(&cmd.user_id, &cmd.symbol, side);
        let _claim = self.entities.claim_trigger(&key).await;
        let mut trigger = self
            .find_trigger(&key)
            .await?
            .ok_or_else(|| Rejection::business(missing))?;
        if trigger.is_armed() {
            return Err(Rejection::business("Trigger is already set for that stock"));
        }

        trigger.when = cmd.amount;
        self.entities.set_trigger(&trigger).await?;
        info!("🎯 {} {} {} armed at {}", cmd.user_id, side, cmd.symbol, cmd.amount);

        Ok(Response {
            symbol: Some(trigger.symbol),
            ..Response::ok()
        })
    }

    /// Put back a trigger after a failed follow-up write
    async fn restore_trigger(&self, key: &TriggerKey, previous: Option<Trigger>) {
        let result = match previous {
            Some(trigger) => self.entities.set_trigger(&trigger).await,
            None => self.entities.cancel_trigger(key).await.map(|_| ()),
        };
        if let Err(e) = result {
            error!("❌ could not roll back trigger {}: {}", key, e);
        }
    }

    async fn shift_reserved_money(&self, user_id: &str, delta: Money) -> crate::core::Result<()> {
        match delta.cmp(&0) {
            Ordering::Greater => self.entities.reserve_money(user_id, delta).await.map(|_| ()),
            Ordering::Less => self.entities.unreserve_money(user_id, -delta).await.map(|_| ()),
            Ordering::Equal => Ok(()),
        }
    }

    async fn shift_reserved_shares(&self, user_id: &str, symbol: &str, delta: Shares) -> crate::core::Result<()> {
        match delta.cmp(&0) {
            Ordering::Greater => self
                .entities
                .reserve_shares(user_id, symbol, delta)
                .await
                .map(|_| ()),
            Ordering::Less => self
                .entities
                .unreserve_shares(user_id, symbol, -delta)
                .await
                .map(|_| ()),
            Ordering::Equal => Ok(()),
        }
    }

    /// Shares of `symbol` already promised to live SELL intents
    fn intent_shares(&self, user_id: &str, symbol: &str) -> Shares {
        self.reservations
            .reserved_shares(user_id)
            .get(symbol)
            .copied()
            .unwrap_or(0)
    }

    /// Money has already moved; a lost history row is reported, not failed
    async fn record_history(&self, cmd: &Command, settlement: &Settlement) {
        let record = TransactionRecord::from_settlement(settlement, false);
        if let Err(e) = self.entities.append_transaction(&record).await {
            warn!("⚠️ history append for {} failed after settlement: {}", cmd.user_id, e);
            self.audit
                .debug_event(cmd, &format!("history append failed after settlement: {}", e));
        }
    }
}

/// Ledger view adjusted by intents still waiting in the reservation cache
fn account_snapshot(user: &User, intent_money: Money, intent_shares: &BTreeMap<String, Shares>) -> AccountSnapshot {
    let mut holdings = user.holdings.clone();
    for (symbol, shares) in intent_shares {
        let holding = holdings.entry(symbol.clone()).or_default();
        holding.real -= shares;
        holding.reserved += shares;
    }
    AccountSnapshot {
        balance: user.balance - intent_money,
        reserved: user.reserved.saturating_add(intent_money),
        holdings,
    }
}
