//! Quote feeds - the TCP quote server client and an in-process mock

pub mod tcp_client;
pub mod mock;

pub use tcp_client::{TcpQuoteFeed, parse_quote_line};
pub use mock::MockQuoteFeed;
