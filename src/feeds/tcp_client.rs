//! Quote server client
//!
//! One short-lived connection per request. The server speaks a single line each way:
//! `"<symbol>, <userId>\n"` out, `"<price>,<symbol>,<userId>,<timestamp>,<cryptokey>\n"` back.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::core::{Error, Quote, QuoteSource, Result};

/// Quote server client
pub struct TcpQuoteFeed {
    addr: String,
    timeout: Duration,
}

impl TcpQuoteFeed {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    async fn request(&self, symbol: &str, user_id: &str) -> Result<String> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read_half, mut write_half) = stream.into_split();

        write_half
            .write_all(format!("{}, {}\n", symbol, user_id).as_bytes())
            .await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Quote(format!("quote server closed without answering for {}", symbol)));
        }
        Ok(line)
    }
}

#[async_trait]
impl QuoteSource for TcpQuoteFeed {
    async fn fetch_quote(&self, symbol: &str, user_id: &str) -> Result<Quote> {
        let line = tokio::time::timeout(self.timeout, self.request(symbol, user_id))
            .await
            .map_err(|_| Error::Timeout(format!("quote server {} did not answer in {:?}", self.addr, self.timeout)))??;

        tracing::debug!("quote server -> {}", line.trim_end());
        parse_quote_line(&line)
    }

    fn name(&self) -> &str {
        "quote-server"
    }
}

/// Parse one quote server reply. The price is converted to minor units exactly.
pub fn parse_quote_line(line: &str) -> Result<Quote> {
    let parts: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    if parts.len() != 5 {
        return Err(Error::Quote(format!("malformed quote reply: {:?}", line.trim())));
    }

    let price = Decimal::from_str(parts[0])
        .map_err(|e| Error::Quote(format!("bad price {:?}: {}", parts[0], e)))?;
    let minor = price * Decimal::ONE_HUNDRED;
    if !minor.fract().is_zero() {
        return Err(Error::Quote(format!("price {} has sub-cent precision", price)));
    }
    let minor = minor
        .to_i64()
        .filter(|p| *p > 0)
        .ok_or_else(|| Error::Quote(format!("price {} out of range", price)))?;

    let timestamp = parts[3]
        .parse::<u64>()
        .map_err(|e| Error::Quote(format!("bad quote timestamp {:?}: {}", parts[3], e)))?;

    Ok(Quote {
        symbol: parts[1].to_string(),
        price: minor,
        user_id: parts[2].to_string(),
        timestamp,
        cryptokey: parts[4].to_string(),
    })
}
