//! Reservation cache - BUY/SELL intents waiting for COMMIT or CANCEL
//!
//! Intents never touch the ledger. Each (user, side) holds a stack; the newest
//! intent is the one a COMMIT or CANCEL acts on. Everything here is advisory: a
//! commit re-validates against the ledger.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeMap;

use crate::core::{Money, PendingReservation, Shares, Side};

type StackKey = (String, Side);

#[derive(Debug)]
struct ReservationStack {
    items: Vec<PendingReservation>,
    /// Lifetime of the entry as a whole: the expiry of its newest item
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ReservationCache {
    stacks: DashMap<StackKey, ReservationStack>,
}

impl ReservationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new intent; it becomes the top of its (user, side) stack
    pub fn push(&self, reservation: PendingReservation) {
        let now = Utc::now();
        let key = (reservation.user_id.clone(), reservation.side);
        let mut stack = self.stacks.entry(key).or_insert_with(|| ReservationStack {
            items: Vec::new(),
            expires_at: reservation.expiry,
        });
        if stack.expires_at <= now {
            stack.items.clear();
        }
        stack.expires_at = reservation.expiry;
        stack.items.push(reservation);
    }

    /// Take the newest intent.
    ///
    /// An expired entry, or an expired top, discards the whole stack: older
    /// intents are not resurrected once a newer one has lapsed.
    pub fn pop(&self, user_id: &str, side: Side) -> Option<PendingReservation> {
        let now = Utc::now();
        let mut occupied = match self.stacks.entry((user_id.to_string(), side)) {
            Entry::Vacant(_) => return None,
            Entry::Occupied(occupied) => occupied,
        };

        let stack = occupied.get_mut();
        let top_expired = stack.items.last().is_none_or(|top| top.is_expired(now));
        if stack.expires_at <= now || top_expired {
            occupied.remove();
            tracing::debug!("{} {} intents expired", user_id, side);
            return None;
        }

        let top = stack.items.pop();
        let next_expiry = stack.items.last().map(|next| next.expiry);
        match next_expiry {
            Some(expiry) if expiry > now => occupied.get_mut().expires_at = expiry,
            _ => {
                occupied.remove();
            }
        }
        top
    }

    /// Cash held back by live BUY intents
    pub fn reserved_money(&self, user_id: &str) -> Money {
        let mut total = 0;
        self.scan(user_id, Side::Buy, |r| total = r.reserved.saturating_add(total));
        total
    }

    /// Shares held back by live SELL intents, per symbol
    pub fn reserved_shares(&self, user_id: &str) -> BTreeMap<String, Shares> {
        let mut shares = BTreeMap::new();
        self.scan(user_id, Side::Sell, |r| {
            *shares.entry(r.symbol.clone()).or_insert(0) += r.shares;
        });
        shares
    }

    /// Visit live intents newest first, stopping at the first expired one
    fn scan(&self, user_id: &str, side: Side, mut visit: impl FnMut(&PendingReservation)) {
        let now = Utc::now();
        let key = (user_id.to_string(), side);
        match self.stacks.get(&key) {
            None => return,
            Some(stack) if stack.expires_at > now => {
                for item in stack.items.iter().rev() {
                    if item.is_expired(now) {
                        break;
                    }
                    visit(item);
                }
                return;
            }
            Some(_) => {}
        }
        self.stacks.remove_if(&key, |_, stack| stack.expires_at <= now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn intent(user: &str, side: Side, symbol: &str, shares: Shares, price: Money, ttl_secs: i64) -> PendingReservation {
        PendingReservation {
            user_id: user.to_string(),
            side,
            symbol: symbol.to_string(),
            shares,
            amount: shares * price,
            reserved: if side == Side::Buy { shares * price } else { 0 },
            expiry: Utc::now() + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn test_pop_empty_is_none() {
        let cache = ReservationCache::new();
        assert!(cache.pop("u1", Side::Buy).is_none());
    }

    #[test]
    fn test_push_then_pop_returns_same_item() {
        let cache = ReservationCache::new();
        let item = intent("u1", Side::Buy, "ABC", 2, 1250, 60);
        cache.push(item.clone());
        assert_eq!(cache.pop("u1", Side::Buy), Some(item));
        assert!(cache.pop("u1", Side::Buy).is_none());
    }

    #[test]
    fn test_sides_are_independent() {
        let cache = ReservationCache::new();
        cache.push(intent("u1", Side::Buy, "ABC", 2, 1250, 60));
        assert!(cache.pop("u1", Side::Sell).is_none());
        assert!(cache.pop("u2", Side::Buy).is_none());
        assert!(cache.pop("u1", Side::Buy).is_some());
    }

    #[test]
    fn test_pop_is_newest_first() {
        let cache = ReservationCache::new();
        cache.push(intent("u1", Side::Buy, "ABC", 1, 1250, 60));
        cache.push(intent("u1", Side::Buy, "XYZ", 3, 100, 61));

        assert_eq!(cache.pop("u1", Side::Buy).unwrap().symbol, "XYZ");
        assert_eq!(cache.pop("u1", Side::Buy).unwrap().symbol, "ABC");
    }

    #[test]
    fn test_expired_top_voids_older_items() {
        let cache = ReservationCache::new();
        // Push order is irrelevant to the check; an expired top drops the entry
        let older = intent("u1", Side::Buy, "ABC", 1, 1250, 60);
        let expired = intent("u1", Side::Buy, "XYZ", 1, 1250, -1);
        cache.stacks.insert(
            ("u1".to_string(), Side::Buy),
            ReservationStack {
                expires_at: older.expiry,
                items: vec![older, expired],
            },
        );

        assert!(cache.pop("u1", Side::Buy).is_none());
        assert!(cache.pop("u1", Side::Buy).is_none());
        assert_eq!(cache.reserved_money("u1"), 0);
    }

    #[test]
    fn test_expired_entry_is_discarded() {
        let cache = ReservationCache::new();
        cache.push(intent("u1", Side::Sell, "ABC", 2, 1250, -5));
        assert!(cache.pop("u1", Side::Sell).is_none());
        assert!(cache.stacks.is_empty());
    }

    #[test]
    fn test_push_onto_expired_entry_starts_fresh() {
        let cache = ReservationCache::new();
        cache.push(intent("u1", Side::Buy, "OLD", 1, 1250, -5));
        cache.push(intent("u1", Side::Buy, "NEW", 1, 1250, 60));

        assert_eq!(cache.pop("u1", Side::Buy).unwrap().symbol, "NEW");
        assert!(cache.pop("u1", Side::Buy).is_none());
    }

    #[test]
    fn test_reserved_money_sums_live_buys() {
        let cache = ReservationCache::new();
        cache.push(intent("u1", Side::Buy, "ABC", 2, 1250, 60));
        cache.push(intent("u1", Side::Buy, "XYZ", 1, 500, 60));
        cache.push(intent("u1", Side::Sell, "ABC", 4, 1250, 60));

        assert_eq!(cache.reserved_money("u1"), 3000);
        assert_eq!(cache.reserved_money("u2"), 0);
    }

    #[test]
    fn test_reserved_money_stops_at_first_expired() {
        let cache = ReservationCache::new();
        let live = intent("u1", Side::Buy, "ABC", 2, 1250, 60);
        let lapsed = intent("u1", Side::Buy, "XYZ", 1, 500, -1);
        let oldest = intent("u1", Side::Buy, "DEF", 1, 700, 60);
        cache.stacks.insert(
            ("u1".to_string(), Side::Buy),
            ReservationStack {
                expires_at: live.expiry,
                items: vec![oldest, lapsed, live],
            },
        );

        assert_eq!(cache.reserved_money("u1"), 2500);
    }

    #[test]
    fn test_reserved_shares_by_symbol() {
        let cache = ReservationCache::new();
        cache.push(intent("u1", Side::Sell, "ABC", 2, 1250, 60));
        cache.push(intent("u1", Side::Sell, "ABC", 1, 1250, 60));
        cache.push(intent("u1", Side::Sell, "XYZ", 5, 100, 60));

        let shares = cache.reserved_shares("u1");
        assert_eq!(shares.get("ABC"), Some(&3));
        assert_eq!(shares.get("XYZ"), Some(&5));
    }

    #[test]
    fn test_expired_entry_pruned_on_read() {
        let cache = ReservationCache::new();
        cache.push(intent("u1", Side::Sell, "ABC", 2, 1250, -1));
        assert!(cache.reserved_shares("u1").is_empty());
        assert!(cache.stacks.is_empty());
    }
}
