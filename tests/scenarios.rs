//! End-to-end scenarios over the TCP command server

use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use daytrade_engine::Services;
use daytrade_engine::core::{Config, Holding, Ledger, Response};
use daytrade_engine::feeds::MockQuoteFeed;
use daytrade_engine::ledger::MemoryLedger;
use daytrade_engine::server::Server;

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn raw(&mut self, line: &str) -> Response {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let reply = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn send(&mut self, request: serde_json::Value) -> Response {
        self.raw(&request.to_string()).await
    }
}

struct Platform {
    ledger: Arc<MemoryLedger>,
    feed: Arc<MockQuoteFeed>,
    services: Services,
    addr: std::net::SocketAddr,
    _stop: watch::Sender<bool>,
}

impl Platform {
    async fn start() -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let feed = Arc::new(MockQuoteFeed::new(1250));
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        // Quotes are re-read on every request so price moves are visible at once
        config.quote.ttl_secs = 0;

        let services = Services::new(&config, ledger.clone(), feed.clone());
        let server = Server::bind(&config.server.listen_addr, Arc::clone(&services.dispatcher))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(server.run(shutdown));

        Self {
            ledger,
            feed,
            services,
            addr,
            _stop: stop,
        }
    }

    async fn client(&self) -> Client {
        Client::connect(self.addr).await
    }
}

fn add(user: &str, amount: i64) -> serde_json::Value {
    json!({"kind": 1, "userId": user, "amount": amount, "transactionId": 1})
}

#[tokio::test]
async fn test_add_then_quote() {
    let platform = Platform::start().await;
    let mut client = platform.client().await;

    // (a)
    let resp = client.send(add("u1", 10_000)).await;
    assert!(resp.success);
    assert_eq!(platform.ledger.get_user("u1").await.unwrap().balance, 10_000);

    // (b)
    let resp = client
        .send(json!({"kind": 2, "userId": "u1", "stockSymbol": "ABC", "transactionId": 2}))
        .await;
    assert!(resp.success);
    assert_eq!(resp.quote, Some(1250));
    assert_eq!(resp.symbol.as_deref(), Some("ABC"));
}

#[tokio::test]
async fn test_buy_too_small_changes_nothing() {
    let platform = Platform::start().await;
    let mut client = platform.client().await;
    client.send(add("u1", 10_000)).await;

    // (c)
    let resp = client
        .send(json!({"kind": 3, "userId": "u1", "stockSymbol": "ABC", "amount": 1000}))
        .await;
    assert!(!resp.success);
    assert_eq!(
        resp.message.as_deref(),
        Some("Specified amount is not enough to purchase any shares")
    );

    let resp = client.send(json!({"kind": 4, "userId": "u1"})).await;
    assert!(!resp.success);
    let user = platform.ledger.get_user("u1").await.unwrap();
    assert_eq!(user.balance, 10_000);
    assert!(user.holdings.is_empty());
}

#[tokio::test]
async fn test_buy_and_commit() {
    let platform = Platform::start().await;
    let mut client = platform.client().await;
    client.send(add("u1", 10_000)).await;

    // (d)
    let resp = client
        .send(json!({"kind": 3, "userId": "u1", "stockSymbol": "ABC", "amount": 2600}))
        .await;
    assert!(resp.success);
    assert_eq!(resp.shares, Some(2));
    assert_eq!(resp.real_amount, Some(2500));

    let resp = client.send(json!({"kind": 4, "userId": "u1"})).await;
    assert!(resp.success);
    assert_eq!(resp.paid, Some(2500));

    let user = platform.ledger.get_user("u1").await.unwrap();
    assert_eq!(user.balance, 7500);
    assert_eq!(user.holding("ABC").real, 2);
}

#[tokio::test]
async fn test_sell_trigger_settles_on_rise() {
    let platform = Platform::start().await;
    let mut client = platform.client().await;
    client.send(add("u1", 10_000)).await;
    client
        .send(json!({"kind": 3, "userId": "u1", "stockSymbol": "ABC", "amount": 2600}))
        .await;
    client.send(json!({"kind": 4, "userId": "u1"})).await;

    // (e)
    let resp = client
        .send(json!({"kind": 12, "userId": "u1", "stockSymbol": "ABC", "amount": 2500}))
        .await;
    assert!(resp.success, "{:?}", resp.message);
    let user = platform.ledger.get_user("u1").await.unwrap();
    assert_eq!(user.holding("ABC"), Holding { real: 0, reserved: 2 });

    let resp = client
        .send(json!({"kind": 13, "userId": "u1", "stockSymbol": "ABC", "amount": 1300}))
        .await;
    assert!(resp.success, "{:?}", resp.message);

    platform.feed.set_price("ABC", 1400);
    let report = platform.services.triggers.run_pass().await.unwrap();
    assert_eq!(report.settled, 1);

    let user = platform.ledger.get_user("u1").await.unwrap();
    assert_eq!(user.balance, 7500 + 2800);
    assert!(user.holdings.is_empty());
    assert!(platform.ledger.user_triggers("u1").await.unwrap().is_empty());

    let summary = client.send(json!({"kind": 17, "userId": "u1"})).await;
    let history = summary.transactions.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[1].triggered);
}

#[tokio::test]
async fn test_one_connection_many_requests_in_order() {
    let platform = Platform::start().await;
    let mut client = platform.client().await;

    for i in 1..=5 {
        let resp = client.send(add("u1", 100 * i)).await;
        assert!(resp.success);
    }
    let summary = client.send(json!({"kind": 17, "userId": "u1"})).await;
    assert_eq!(summary.status.unwrap().balance, 1500);
}

#[tokio::test]
async fn test_malformed_request_keeps_session_open() {
    let platform = Platform::start().await;
    let mut client = platform.client().await;

    let resp = client.raw("this is not json").await;
    assert!(!resp.success);
    assert_eq!(resp.message.as_deref(), Some("Internal error parsing request"));

    let resp = client.send(add("u1", 10)).await;
    assert!(resp.success);
}

#[tokio::test]
async fn test_sessions_run_concurrently() {
    let platform = Arc::new(Platform::start().await);

    let mut handles = Vec::new();
    for i in 0..8 {
        let platform = Arc::clone(&platform);
        handles.push(tokio::spawn(async move {
            let mut client = platform.client().await;
            let user = format!("user{}", i);
            assert!(client.send(add(&user, 5000)).await.success);
            let resp = client
                .send(json!({"kind": 3, "userId": user, "stockSymbol": "ABC", "amount": 2500}))
                .await;
            assert!(resp.success);
            assert!(client.send(json!({"kind": 4, "userId": user})).await.success);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for i in 0..8 {
        let user = platform.ledger.get_user(&format!("user{}", i)).await.unwrap();
        assert_eq!(user.balance, 2500);
        assert_eq!(user.holding("ABC").real, 2);
    }
}

#[tokio::test]
async fn test_dumplog_returns_users_events() {
    let platform = Platform::start().await;
    let mut client = platform.client().await;
    client.send(add("u1", 10_000)).await;
    client.send(add("u2", 10_000)).await;

    let resp = client
        .send(json!({"kind": 15, "userId": "u1", "fileName": "u1.log"}))
        .await;
    assert!(resp.success);
    let events: serde_json::Value = serde_json::from_slice(&resp.file.unwrap()).unwrap();
    let events = events.as_array().unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e["userId"] == "u1"));

    let resp = client.send(json!({"kind": 16, "fileName": "all.log"})).await;
    assert!(resp.success);
    let all: serde_json::Value = serde_json::from_slice(&resp.file.unwrap()).unwrap();
    assert!(all.as_array().unwrap().len() > events.len());
}
