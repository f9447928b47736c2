//! Trigger manager - periodic settlement of armed stop-buy / stop-sell orders
//!
//! Each pass lists armed triggers, prices them concurrently through the quote
//! cache and settles every firing trigger in one bulk ledger update. Money for
//! these orders was reserved when the amount was set, so settlement draws from
//! the reserved columns only.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{EntityCache, QuoteCache};
use crate::core::{
    AccountAction, AuditSink, Command, CommandKind, Error, Result, Settlement, SettlementMode, Side,
    TransactionRecord, Trigger,
};

/// What one pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Armed triggers examined
    pub armed: usize,
    /// Triggers past their threshold with at least one share to settle
    pub fired: usize,
    /// Fired triggers the ledger actually settled
    pub settled: usize,
}

pub struct TriggerManager {
    entities: Arc<EntityCache>,
    quotes: Arc<QuoteCache>,
    audit: Arc<dyn AuditSink>,
    interval: Duration,
}

impl TriggerManager {
    pub fn new(
        entities: Arc<EntityCache>,
        quotes: Arc<QuoteCache>,
        audit: Arc<dyn AuditSink>,
        interval: Duration,
    ) -> Self {
        Self {
            entities,
            quotes,
            audit,
            interval,
        }
    }

    /// Run passes every interval until `shutdown` flips
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("⏱️ trigger manager running every {:?}", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.run_pass().await {
                        Ok(report) if report.fired > 0 => info!(
                            "🔔 trigger pass: {} armed, {} fired, {} settled",
                            report.armed, report.fired, report.settled
                        ),
                        Ok(report) => debug!("trigger pass: {} armed, none fired", report.armed),
                        Err(e) => error!("❌ trigger pass failed: {}", e),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!("trigger manager stopped");
        })
    }

    pub async fn run_pass(&self) -> Result<PassReport> {
        let armed = self.entities.armed_triggers().await?;
        let mut report = PassReport {
            armed: armed.len(),
            ..PassReport::default()
        };
        if armed.is_empty() {
            return Ok(report);
        }

        let quotes = join_all(
            armed
                .iter()
                .map(|t| self.quotes.get_quote(&t.symbol, &t.user_id, t.transaction_id)),
        )
        .await;

        let mut firing: Vec<(Trigger, Settlement)> = Vec::new();
        for (trigger, quote) in armed.into_iter().zip(quotes) {
            let price = match quote {
                Ok(quote) => quote.price,
                Err(e) => {
                    warn!("no quote for trigger {}: {}", trigger.key(), e);
                    continue;
                }
            };
            if !trigger.fires_at(price) {
                continue;
            }
            if let Some(settlement) = settlement_for(&trigger, price) {
                firing.push((trigger, settlement));
            } else {
                debug!("trigger {} fired but budget {} buys nothing at {}", trigger.key(), trigger.amount, price);
            }
        }
        if firing.is_empty() {
            return Ok(report);
        }

        // No handler may touch these triggers until they are settled and removed
        let _claims = self
            .entities
            .claim_triggers(firing.iter().map(|(t, _)| t.key()))
            .await;
        let firing = self.still_current(firing).await;
        report.fired = firing.len();
        if firing.is_empty() {
            return Ok(report);
        }

        let settlements: Vec<Settlement> = firing.iter().map(|(_, s)| s.clone()).collect();
        let applied = self
            .entities
            .bulk_settle(&settlements, SettlementMode::Reserved)
            .await?;

        let mut settled = Vec::with_capacity(firing.len());
        for ((trigger, settlement), ok) in firing.into_iter().zip(applied) {
            if ok {
                settled.push((trigger, settlement));
            } else {
                warn!("⚠️ trigger {} could not be settled, left armed", trigger.key());
            }
        }
        report.settled = settled.len();
        if settled.is_empty() {
            return Ok(report);
        }

        let records: Vec<TransactionRecord> = settled
            .iter()
            .map(|(_, s)| TransactionRecord::from_settlement(s, true))
            .collect();
        if let Err(e) = self.entities.bulk_append_transactions(&records).await {
            warn!("⚠️ history append for {} triggered settlements failed: {}", records.len(), e);
        }

        let keys: Vec<_> = settled.iter().map(|(t, _)| t.key()).collect();
        self.entities.remove_triggers(&keys).await?;

        for (trigger, settlement) in &settled {
            let action = match trigger.side {
                Side::Buy => AccountAction::Remove,
                Side::Sell => AccountAction::Add,
            };
            self.audit
                .account_transaction(&trigger.user_id, trigger.transaction_id, action, settlement.amount);
            self.audit.system_event(&system_command(trigger, settlement));
            info!(
                "🔔 {} {} {} x{} settled for {}",
                trigger.user_id, trigger.side, trigger.symbol, settlement.shares, settlement.amount
            );
        }

        Ok(report)
    }
}

impl TriggerManager {
    /// Drop triggers that were re-set or cancelled after they were listed
    async fn still_current(&self, firing: Vec<(Trigger, Settlement)>) -> Vec<(Trigger, Settlement)> {
        let mut current = Vec::with_capacity(firing.len());
        for (listed, settlement) in firing {
            match self.entities.get_trigger(&listed.key()).await {
                Ok(trigger) if trigger == listed => current.push((listed, settlement)),
                Ok(_) | Err(Error::NotFound(_)) => {
                    debug!("trigger {} changed since it was listed, skipped", listed.key())
                }
                Err(e) => warn!("could not re-read trigger {}: {}", listed.key(), e),
            }
        }
        current
    }
}

/// BUY spends as much of the budget as whole shares allow; SELL sells the reserved shares
fn settlement_for(trigger: &Trigger, price: i64) -> Option<Settlement> {
    let shares = match trigger.side {
        Side::Buy => trigger.amount / price,
        Side::Sell => trigger.shares,
    };
    if shares <= 0 {
        return None;
    }
    Some(Settlement {
        user_id: trigger.user_id.clone(),
        side: trigger.side,
        symbol: trigger.symbol.clone(),
        shares,
        amount: shares.checked_mul(price)?,
        reserved: match trigger.side {
            Side::Buy => trigger.amount,
            Side::Sell => 0,
        },
    })
}

fn system_command(trigger: &Trigger, settlement: &Settlement) -> Command {
    let kind = match trigger.side {
        Side::Buy => CommandKind::SetBuyTrigger,
        Side::Sell => CommandKind::SetSellTrigger,
    };
    Command::new(kind, trigger.user_id.clone())
        .with_symbol(trigger.symbol.clone())
        .with_amount(settlement.amount)
        .with_transaction_id(trigger.transaction_id)
}
