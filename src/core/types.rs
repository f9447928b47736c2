//! Core types - Ledger documents, commands and responses
//!
//! Money is always integer minor units (cents) and shares are whole units, so no
//! arithmetic in the engine ever touches floating point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{Error, Result};

/// Cash amount in minor units
pub type Money = i64;

/// Whole share count
pub type Shares = i64;

/// Render minor units as a 2-decimal string (e.g. 1250 -> "12.50")
pub fn format_money(amount: Money) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Direction of an intent, trigger or history record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Ledger documents
// ─────────────────────────────────────────────────────────────

/// Per-symbol share position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    /// Shares the user can freely sell
    pub real: Shares,
    /// Shares set aside by a SELL trigger
    pub reserved: Shares,
}

/// Users collection document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub balance: Money,
    /// Cash set aside by BUY triggers
    pub reserved: Money,
    pub holdings: BTreeMap<String, Holding>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            balance: 0,
            reserved: 0,
            holdings: BTreeMap::new(),
        }
    }

    /// Position for a symbol, zero if the user never held it
    pub fn holding(&self, symbol: &str) -> Holding {
        self.holdings.get(symbol).copied().unwrap_or_default()
    }
}

/// Account view returned by DISPLAY_SUMMARY
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: Money,
    pub reserved: Money,
    pub holdings: BTreeMap<String, Holding>,
}

/// Unique identity of a trigger
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerKey {
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
}

impl TriggerKey {
    pub fn new(user_id: impl Into<String>, symbol: impl Into<String>, side: Side) -> Self {
        Self {
            user_id: user_id.into(),
            symbol: symbol.into(),
            side,
        }
    }
}

impl std::fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.user_id, self.side, self.symbol)
    }
}

/// Triggers collection document: a conditional stop-buy / stop-sell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    /// Command that created the trigger
    pub transaction_id: i64,
    /// SELL only: shares held in the ledger's reserved column
    pub shares: Shares,
    /// Budget (BUY) or requested proceeds (SELL)
    pub amount: Money,
    /// Threshold price; 0 means not armed yet
    pub when: Money,
}

impl Trigger {
    pub fn key(&self) -> TriggerKey {
        TriggerKey::new(self.user_id.clone(), self.symbol.clone(), self.side)
    }

    pub fn is_armed(&self) -> bool {
        self.when > 0
    }

    /// BUY fires at or below the threshold, SELL at or above it
    pub fn fires_at(&self, price: Money) -> bool {
        if !self.is_armed() {
            return false;
        }
        match self.side {
            Side::Buy => price <= self.when,
            Side::Sell => price >= self.when,
        }
    }
}

/// Transactions collection document (user history)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub user_id: String,
    pub side: Side,
    pub symbol: String,
    pub amount: Money,
    pub shares: Shares,
    /// Settled by the trigger manager rather than a user commit
    pub triggered: bool,
    /// Unix seconds
    pub timestamp: i64,
}

impl TransactionRecord {
    pub fn from_settlement(settlement: &Settlement, triggered: bool) -> Self {
        Self {
            user_id: settlement.user_id.clone(),
            side: settlement.side,
            symbol: settlement.symbol.clone(),
            amount: settlement.amount,
            shares: settlement.shares,
            triggered,
            timestamp: Utc::now().timestamp(),
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Intents and settlement
// ─────────────────────────────────────────────────────────────

/// Provisional BUY/SELL awaiting COMMIT or CANCEL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReservation {
    pub user_id: String,
    pub side: Side,
    pub symbol: String,
    pub shares: Shares,
    /// Total cost (BUY) or proceeds (SELL) at the quoted price
    pub amount: Money,
    /// BUY only: cash held back from the available balance
    pub reserved: Money,
    pub expiry: DateTime<Utc>,
}

impl PendingReservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

/// Where a settlement draws its money or shares from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementMode {
    /// Cache-only intent: debit balance / real shares directly
    Intent,
    /// Set-trigger flow: debit the ledger's reserved columns
    Reserved,
}

/// A ledger-ready transfer of money against shares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub user_id: String,
    pub side: Side,
    pub symbol: String,
    pub shares: Shares,
    /// Cost (BUY) or proceeds (SELL)
    pub amount: Money,
    /// Reserved budget released by a BUY trigger
    pub reserved: Money,
}

impl From<&PendingReservation> for Settlement {
    fn from(pending: &PendingReservation) -> Self {
        Self {
            user_id: pending.user_id.clone(),
            side: pending.side,
            symbol: pending.symbol.clone(),
            shares: pending.shares,
            amount: pending.amount,
            reserved: pending.reserved,
        }
    }
}

/// Live price from the quote source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub symbol: String,
    pub price: Money,
    pub user_id: String,
    /// Quote server timestamp (ms)
    pub timestamp: u64,
    pub cryptokey: String,
}

// ─────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────

/// The 17 operations, with their stable wire ordinals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CommandKind {
    Add = 1,
    Quote = 2,
    Buy = 3,
    CommitBuy = 4,
    CancelBuy = 5,
    Sell = 6,
    CommitSell = 7,
    CancelSell = 8,
    SetBuyAmount = 9,
    CancelSetBuy = 10,
    SetBuyTrigger = 11,
    SetSellAmount = 12,
    SetSellTrigger = 13,
    CancelSetSell = 14,
    DumpLog = 15,
    AdminDumpLog = 16,
    DisplaySummary = 17,
}

impl CommandKind {
    pub const ALL: [CommandKind; 17] = [
        CommandKind::Add,
        CommandKind::Quote,
        CommandKind::Buy,
        CommandKind::CommitBuy,
        CommandKind::CancelBuy,
        CommandKind::Sell,
        CommandKind::CommitSell,
        CommandKind::CancelSell,
        CommandKind::SetBuyAmount,
        CommandKind::CancelSetBuy,
        CommandKind::SetBuyTrigger,
        CommandKind::SetSellAmount,
        CommandKind::SetSellTrigger,
        CommandKind::CancelSetSell,
        CommandKind::DumpLog,
        CommandKind::AdminDumpLog,
        CommandKind::DisplaySummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Add => "ADD",
            CommandKind::Quote => "QUOTE",
            CommandKind::Buy => "BUY",
            CommandKind::CommitBuy => "COMMIT_BUY",
            CommandKind::CancelBuy => "CANCEL_BUY",
            CommandKind::Sell => "SELL",
            CommandKind::CommitSell => "COMMIT_SELL",
            CommandKind::CancelSell => "CANCEL_SELL",
            CommandKind::SetBuyAmount => "SET_BUY_AMOUNT",
            CommandKind::CancelSetBuy => "CANCEL_SET_BUY",
            CommandKind::SetBuyTrigger => "SET_BUY_TRIGGER",
            CommandKind::SetSellAmount => "SET_SELL_AMOUNT",
            CommandKind::SetSellTrigger => "SET_SELL_TRIGGER",
            CommandKind::CancelSetSell => "CANCEL_SET_SELL",
            CommandKind::DumpLog => "DUMPLOG",
            CommandKind::AdminDumpLog => "ADMIN_DUMPLOG",
            CommandKind::DisplaySummary => "DISPLAY_SUMMARY",
        }
    }

    /// Kinds that carry a strictly positive money amount
    pub fn requires_amount(&self) -> bool {
        matches!(
            self,
            CommandKind::Add
                | CommandKind::Buy
                | CommandKind::Sell
                | CommandKind::SetBuyAmount
                | CommandKind::SetBuyTrigger
                | CommandKind::SetSellAmount
                | CommandKind::SetSellTrigger
        )
    }

    pub fn requires_symbol(&self) -> bool {
        matches!(
            self,
            CommandKind::Quote
                | CommandKind::Buy
                | CommandKind::Sell
                | CommandKind::SetBuyAmount
                | CommandKind::CancelSetBuy
                | CommandKind::SetBuyTrigger
                | CommandKind::SetSellAmount
                | CommandKind::SetSellTrigger
                | CommandKind::CancelSetSell
        )
    }

    pub fn requires_user(&self) -> bool {
        !matches!(self, CommandKind::AdminDumpLog)
    }
}

impl TryFrom<i64> for CommandKind {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        CommandKind::ALL
            .iter()
            .copied()
            .find(|kind| *kind as i64 == value)
            .ok_or_else(|| Error::Dispatch(format!("unknown command kind {}", value)))
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request as it arrives on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandEnvelope {
    pub kind: i64,
    pub user_id: String,
    pub amount: Money,
    pub stock_symbol: String,
    pub file_name: String,
    pub transaction_id: i64,
    /// Issuance time, unix ms
    pub timestamp: i64,
}

/// A decoded, immutable command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub user_id: String,
    pub amount: Money,
    pub symbol: String,
    pub filename: String,
    pub transaction_id: i64,
    pub timestamp: i64,
}

impl Command {
    pub fn new(kind: CommandKind, user_id: impl Into<String>) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            amount: 0,
            symbol: String::new(),
            filename: String::new(),
            transaction_id: 0,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = symbol.into();
        self
    }

    pub fn with_amount(mut self, amount: Money) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: i64) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    /// Reject malformed commands before they reach caches or the ledger
    pub fn validate(&self) -> Result<()> {
        if self.kind.requires_user() && self.user_id.trim().is_empty() {
            return Err(Error::Validation(format!("{} requires a user id", self.kind)));
        }
        if self.kind.requires_symbol() && self.symbol.trim().is_empty() {
            return Err(Error::Validation(format!("{} requires a stock symbol", self.kind)));
        }
        if self.kind.requires_amount() && self.amount <= 0 {
            return Err(Error::Validation(format!(
                "{} requires a positive amount, got {}",
                self.kind, self.amount
            )));
        }
        Ok(())
    }
}

impl TryFrom<CommandEnvelope> for Command {
    type Error = Error;

    fn try_from(envelope: CommandEnvelope) -> Result<Self> {
        Ok(Self {
            kind: CommandKind::try_from(envelope.kind)?,
            user_id: envelope.user_id.trim().to_string(),
            amount: envelope.amount,
            symbol: envelope.stock_symbol.trim().to_string(),
            filename: envelope.file_name,
            transaction_id: envelope.transaction_id,
            timestamp: envelope.timestamp,
        })
    }
}

impl From<&Command> for CommandEnvelope {
    fn from(cmd: &Command) -> Self {
        Self {
            kind: cmd.kind as i64,
            user_id: cmd.user_id.clone(),
            amount: cmd.amount,
            stock_symbol: cmd.symbol.clone(),
            file_name: cmd.filename.clone(),
            transaction_id: cmd.transaction_id,
            timestamp: cmd.timestamp,
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────

/// Reply envelope; only the fields relevant to the command kind are set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_amount: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_amount: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<Shares>,
    /// Unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares_affordable: Option<Shares>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affordable_amount: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<TransactionRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Vec<Trigger>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<Vec<u8>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Audit events
// ─────────────────────────────────────────────────────────────

/// Money movement recorded by an AccountTransaction event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountAction {
    Add,
    Remove,
    Reserve,
    Unreserve,
}

/// Event-specific payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventDetail {
    UserCommand {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        funds: Option<Money>,
    },
    QuoteServer {
        price: String,
        symbol: String,
        quote_server_time: u64,
        cryptokey: String,
    },
    AccountTransaction {
        action: AccountAction,
        funds: Money,
    },
    SystemEvent {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        funds: Option<Money>,
    },
    ErrorEvent {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        funds: Option<Money>,
        error_message: String,
    },
    DebugEvent {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        funds: Option<Money>,
        debug_message: String,
    },
}

/// EventLogs collection document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unix ms
    pub timestamp: i64,
    pub server: String,
    pub transaction_num: i64,
    pub user_id: String,
    #[serde(flatten)]
    pub detail: EventDetail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind_ordinals_are_stable() {
        for (i, kind) in CommandKind::ALL.iter().enumerate() {
            assert_eq!(*kind as u8, i as u8 + 1);
            assert_eq!(CommandKind::try_from(i as i64 + 1).unwrap(), *kind);
        }
        assert!(CommandKind::try_from(0).is_err());
        assert!(CommandKind::try_from(18).is_err());
        assert!(CommandKind::try_from(300).is_err());
        assert!(CommandKind::try_from(-1).is_err());
    }

    #[test]
    fn test_envelope_decodes_into_command() {
        let line = r#"{"kind":3,"userId":" u1 ","amount":2600,"stockSymbol":"ABC","transactionId":7}"#;
        let envelope: CommandEnvelope = serde_json::from_str(line).unwrap();
        let cmd = Command::try_from(envelope).unwrap();
        assert_eq!(cmd.kind, CommandKind::Buy);
        assert_eq!(cmd.user_id, "u1");
        assert_eq!(cmd.symbol, "ABC");
        assert_eq!(cmd.amount, 2600);
        assert_eq!(cmd.transaction_id, 7);
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_missing_fields() {
        let no_amount = Command::new(CommandKind::Add, "u1");
        assert!(matches!(no_amount.validate(), Err(Error::Validation(_))));

        let negative = Command::new(CommandKind::Buy, "u1").with_symbol("ABC").with_amount(-5);
        assert!(negative.validate().is_err());

        let no_symbol = Command::new(CommandKind::Quote, "u1");
        assert!(no_symbol.validate().is_err());

        let no_user = Command::new(CommandKind::DisplaySummary, "");
        assert!(no_user.validate().is_err());

        let admin = Command::new(CommandKind::AdminDumpLog, "");
        assert!(admin.validate().is_ok());
    }

    #[test]
    fn test_trigger_firing_direction() {
        let mut trig = Trigger {
            user_id: "u1".into(),
            symbol: "ABC".into(),
            side: Side::Sell,
            transaction_id: 1,
            shares: 2,
            amount: 2500,
            when: 0,
        };
        assert!(!trig.fires_at(9999));

        trig.when = 1300;
        assert!(trig.fires_at(1300));
        assert!(trig.fires_at(1400));
        assert!(!trig.fires_at(1299));

        trig.side = Side::Buy;
        assert!(trig.fires_at(1300));
        assert!(trig.fires_at(1000));
        assert!(!trig.fires_at(1301));
    }

    #[test]
    fn test_format_money() {
        assert_eq!(format_money(1250), "12.50");
        assert_eq!(format_money(5), "0.05");
        assert_eq!(format_money(-199), "-1.99");
    }

    #[test]
    fn test_response_omits_unset_fields() {
        let resp = Response {
            shares: Some(2),
            ..Response::ok()
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"success":true,"shares":2}"#);
    }
}
