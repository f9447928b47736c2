//! Command dispatch - decode, look up the handler, encode
//!
//! The handler table is built once at construction and never changes. Every
//! command is audited before it runs, whether it succeeds or not.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::core::{AuditSink, Command, CommandEnvelope, CommandKind, Response};
use crate::engine::{Rejection, TransactionEngine};

/// Fixed reply for a request that is not valid JSON
pub const PARSE_ERROR: &str = "Internal error parsing request";

type Handler =
    for<'a> fn(&'a TransactionEngine, &'a Command) -> BoxFuture<'a, Result<Response, Rejection>>;

pub struct Dispatcher {
    engine: Arc<TransactionEngine>,
    audit: Arc<dyn AuditSink>,
    handlers: HashMap<CommandKind, Handler>,
}

impl Dispatcher {
    pub fn new(engine: Arc<TransactionEngine>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            engine,
            audit,
            handlers: handler_table(),
        }
    }

    /// Decode one wire line and answer it
    pub async fn handle_line(&self, line: &str) -> Response {
        let envelope: CommandEnvelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("undecodable request: {}", e);
                return Response::failure(PARSE_ERROR);
            }
        };
        match Command::try_from(envelope.clone()) {
            Ok(cmd) => self.dispatch(cmd).await,
            Err(e) => {
                warn!("rejected request: {}", e);
                self.audit.request_error(&envelope, &e.to_string());
                Response::failure(e.to_string())
            }
        }
    }

    pub async fn dispatch(&self, cmd: Command) -> Response {
        self.audit.user_command(&cmd);

        if let Err(e) = cmd.validate() {
            debug!("{} from {:?} invalid: {}", cmd.kind, cmd.user_id, e);
            self.audit.error_event(&cmd, &e.to_string());
            return Response::failure(e.to_string());
        }

        let Some(handler) = self.handlers.get(&cmd.kind) else {
            error!("no handler registered for {}", cmd.kind);
            self.audit.error_event(&cmd, "no handler for command");
            return Response::failure(format!("Unsupported command {}", cmd.kind));
        };

        match handler(self.engine.as_ref(), &cmd).await {
            Ok(response) => response,
            Err(rejection) => {
                match &rejection {
                    Rejection::Business(message) => {
                        debug!("{} {} rejected: {}", cmd.user_id, cmd.kind, message)
                    }
                    Rejection::Internal(e) => {
                        error!("❌ {} {} failed: {}", cmd.user_id, cmd.kind, e)
                    }
                }
                self.audit.error_event(&cmd, &rejection.to_string());
                Response::failure(rejection.public_message())
            }
        }
    }
}

fn handler_table() -> HashMap<CommandKind, Handler> {
    let mut table: HashMap<CommandKind, Handler> = HashMap::with_capacity(CommandKind::ALL.len());
    let mut on = |kind: CommandKind, handler: Handler| {
        table.insert(kind, handler);
    };

    on(CommandKind::Add, |e, c| e.add(c).boxed());
    on(CommandKind::Quote, |e, c| e.quote(c).boxed());
    on(CommandKind::Buy, |e, c| e.buy(c).boxed());
    on(CommandKind::CommitBuy, |e, c| e.commit_buy(c).boxed());
    on(CommandKind::CancelBuy, |e, c| e.cancel_buy(c).boxed());
    on(CommandKind::Sell, |e, c| e.sell(c).boxed());
    on(CommandKind::CommitSell, |e, c| e.commit_sell(c).boxed());
    on(CommandKind::CancelSell, |e, c| e.cancel_sell(c).boxed());
    on(CommandKind::SetBuyAmount, |e, c| e.set_buy_amount(c).boxed());
    on(CommandKind::CancelSetBuy, |e, c| e.cancel_set_buy(c).boxed());
    on(CommandKind::SetBuyTrigger, |e, c| e.set_buy_trigger(c).boxed());
    on(CommandKind::SetSellAmount, |e, c| e.set_sell_amount(c).boxed());
    on(CommandKind::SetSellTrigger, |e, c| e.set_sell_trigger(c).boxed());
    on(CommandKind::CancelSetSell, |e, c| e.cancel_set_sell(c).boxed());
    on(CommandKind::DumpLog, |e, c| e.dump_log(c).boxed());
    on(CommandKind::AdminDumpLog, |e, c| e.admin_dump_log(c).boxed());
    on(CommandKind::DisplaySummary, |e, c| e.display_summary(c).boxed());

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Services;
    use crate::core::{Config, EventDetail, Ledger};
    use crate::feeds::MockQuoteFeed;
    use crate::ledger::MemoryLedger;

    fn services() -> (Arc<MemoryLedger>, Services) {
        let ledger = Arc::new(MemoryLedger::new());
        let feed = Arc::new(MockQuoteFeed::new(1250));
        let mut config = Config::default();
        config.ledger.timeout_ms = 200;
        let services = Services::new(&config, ledger.clone(), feed);
        (ledger, services)
    }

    #[test]
    fn test_every_kind_has_a_handler() {
        let table = handler_table();
        for kind in CommandKind::ALL {
            assert!(table.contains_key(&kind), "{} unregistered", kind);
        }
    }

    #[tokio::test]
    async fn test_garbage_line_gets_parse_error() {
        let (_, services) = services();
        let resp = services.dispatcher.handle_line("{not json").await;
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some(PARSE_ERROR));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let (_, services) = services();
        let resp = services.dispatcher.handle_line(r#"{"kind":42,"userId":"u1"}"#).await;
        assert!(!resp.success);
        assert!(resp.message.unwrap().contains("unknown command kind"));
    }

    #[tokio::test]
    async fn test_out_of_range_kind_is_a_dispatch_error() {
        let (ledger, services) = services();
        let resp = services
            .dispatcher
            .handle_line(r#"{"kind":300,"userId":"u1","stockSymbol":"ABC","transactionId":4}"#)
            .await;
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some("Dispatch error: unknown command kind 300"));

        services.audit.flush().await.unwrap();
        let events = ledger.query_events(Some("u1")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transaction_num, 4);
        match &events[0].detail {
            EventDetail::ErrorEvent { command, symbol, error_message, .. } => {
                assert_eq!(command, "KIND_300");
                assert_eq!(symbol.as_deref(), Some("ABC"));
                assert!(error_message.contains("unknown command kind 300"));
            }
            other => panic!("expected an error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_overflow_answers_instead_of_panicking() {
        let (ledger, services) = services();
        let max = format!(r#"{{"kind":1,"userId":"u1","amount":{}}}"#, i64::MAX);
        assert!(services.dispatcher.handle_line(&max).await.success);

        let resp = services
            .dispatcher
            .handle_line(r#"{"kind":1,"userId":"u1","amount":1}"#)
            .await;
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some("Failed to add money to account"));
        assert_eq!(ledger.get_user("u1").await.unwrap().balance, i64::MAX);
    }

    #[tokio::test]
    async fn test_invalid_command_touches_nothing() {
        let (ledger, services) = services();
        let resp = services
            .dispatcher
            .handle_line(r#"{"kind":1,"userId":"u1","amount":-50}"#)
            .await;
        assert!(!resp.success);
        assert!(ledger.get_user("u1").await.is_err());
    }

    #[tokio::test]
    async fn test_commands_and_failures_are_audited() {
        let (ledger, services) = services();
        services
            .dispatcher
            .handle_line(r#"{"kind":1,"userId":"u1","amount":1000,"transactionId":1}"#)
            .await;
        let resp = services
            .dispatcher
            .handle_line(r#"{"kind":4,"userId":"u1","transactionId":2}"#)
            .await;
        assert_eq!(resp.message.as_deref(), Some("There are no pending transactions"));

        services.audit.flush().await.unwrap();
        let events = ledger.query_events(Some("u1")).await.unwrap();
        let commands = events
            .iter()
            .filter(|e| matches!(e.detail, EventDetail::UserCommand { .. }))
            .count();
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.detail {
                EventDetail::ErrorEvent { error_message, .. } => Some(error_message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(commands, 2);
        assert_eq!(errors, vec!["There are no pending transactions".to_string()]);
    }

    #[tokio::test]
    async fn test_internal_failures_are_generic() {
        let (ledger, services) = services();
        ledger.fail_next(usize::MAX);
        let resp = services
            .dispatcher
            .handle_line(r#"{"kind":1,"userId":"u1","amount":1000}"#)
            .await;
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some(crate::engine::INTERNAL_ERROR));
        ledger.fail_next(0);
    }
}
