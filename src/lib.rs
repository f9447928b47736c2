//! daytrade-engine - transaction processing for a simulated day-trading platform
//!
//! Commands arrive over TCP, run against a set of caches in front of the ledger,
//! and a background manager settles conditional orders as quotes move.

pub mod core;
pub mod feeds;
pub mod cache;
pub mod ledger;
pub mod audit;
pub mod engine;
pub mod server;

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::cache::{EntityCache, QuoteCache, ReservationCache};
use crate::core::{AuditSink, Config, Ledger, QuoteSource};
use crate::engine::{Dispatcher, TransactionEngine, TriggerManager};

/// Everything the server and trigger manager share, wired from one config
pub struct Services {
    pub audit: Arc<AuditLog>,
    pub entities: Arc<EntityCache>,
    pub quotes: Arc<QuoteCache>,
    pub reservations: Arc<ReservationCache>,
    pub engine: Arc<TransactionEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub triggers: Arc<TriggerManager>,
}

impl Services {
    /// Must be called inside a tokio runtime: the audit writer is spawned here.
    pub fn new(config: &Config, ledger: Arc<dyn Ledger>, source: Arc<dyn QuoteSource>) -> Self {
        let audit = Arc::new(AuditLog::spawn(Arc::clone(&ledger), &config.server.name, &config.audit));
        let sink: Arc<dyn AuditSink> = audit.clone();

        let entities = Arc::new(EntityCache::new(ledger, config.cache.entity_ttl(), &config.ledger));
        let quotes = Arc::new(QuoteCache::new(source, Arc::clone(&sink), config.quote.ttl()));
        let reservations = Arc::new(ReservationCache::new());

        let engine = Arc::new(TransactionEngine::new(
            Arc::clone(&entities),
            Arc::clone(&quotes),
            Arc::clone(&reservations),
            Arc::clone(&sink),
            config.cache.intent_lifetime(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&engine), Arc::clone(&sink)));
        let triggers = Arc::new(TriggerManager::new(
            Arc::clone(&entities),
            Arc::clone(&quotes),
            sink,
            config.triggers.interval(),
        ));

        Self {
            audit,
            entities,
            quotes,
            reservations,
            engine,
            dispatcher,
            triggers,
        }
    }
}
