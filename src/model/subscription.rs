use crate::model::Symbol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

/// Lifecycle state of one symbol subscription on a collector's connection.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    /// Subscribe frame issued (or queued), ACK outstanding.
    Pending,
    /// Exchange acknowledged the stream; records for this symbol are admitted.
    Subscribed,
    /// Unsubscribe frame issued; entry removed once acknowledged.
    Unsubscribed,
    /// No ACK within the adapter-provided deadline, or the exchange refused.
    Failed,
}

/// Book-keeping for one subscribed symbol.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SubscriptionEntry {
    pub state: SubscriptionState,
    pub last_updated: DateTime<Utc>,
    /// Number of subscribe attempts issued for this symbol. Monotonically non-decreasing.
    pub attempts: u32,
}

impl SubscriptionEntry {
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            state: SubscriptionState::Pending,
            last_updated: now,
            attempts: 1,
        }
    }

    /// Move the entry to `state`, stamping `last_updated`. A transition back to
    /// [`SubscriptionState::Pending`] counts another attempt.
    pub fn mark(&mut self, state: SubscriptionState, now: DateTime<Utc>) {
        if state == SubscriptionState::Pending {
            self.attempts = self.attempts.saturating_add(1);
        }
        self.state = state;
        self.last_updated = now;
    }
}

/// Mapping from canonical [`Symbol`] to its [`SubscriptionEntry`]. Keys are unique and
/// unordered; mutation happens only on the owning collector's task.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct SubscriptionMap(pub HashMap<Symbol, SubscriptionEntry>);

impl Deref for SubscriptionMap {
    type Target = HashMap<Symbol, SubscriptionEntry>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SubscriptionMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl SubscriptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed entries for a collector's configured symbols before any subscribe frame is
    /// issued. Attempts start at zero; the first actioned frame counts attempt one.
    pub fn seed<'a, I>(&mut self, symbols: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        for symbol in symbols {
            self.0.entry(symbol.clone()).or_insert(SubscriptionEntry {
                state: SubscriptionState::Pending,
                last_updated: now,
                attempts: 0,
            });
        }
    }

    /// Insert (or re-arm) entries in [`SubscriptionState::Pending`] for every symbol.
    pub fn mark_pending<'a, I>(&mut self, symbols: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        for symbol in symbols {
            self.0
                .entry(symbol.clone())
                .and_modify(|entry| entry.mark(SubscriptionState::Pending, now))
                .or_insert_with(|| SubscriptionEntry::pending(now));
        }
    }

    /// Symbols currently in the provided state.
    pub fn in_state(&self, state: SubscriptionState) -> Vec<Symbol> {
        self.0
            .iter()
            .filter(|(_, entry)| entry.state == state)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Whether records arriving for `symbol` should be admitted downstream.
    pub fn is_subscribed(&self, symbol: &Symbol) -> bool {
        self.0
            .get(symbol)
            .map(|entry| entry.state == SubscriptionState::Subscribed)
            .unwrap_or(false)
    }

    /// Union of SUBSCRIBED and PENDING symbols, re-armed as PENDING. Called when a
    /// re-established connection must re-issue its subscribe frame.
    pub fn rearm_for_reconnect(&mut self, now: DateTime<Utc>) -> Vec<Symbol> {
        let restore: Vec<Symbol> = self
            .0
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry.state,
                    SubscriptionState::Subscribed | SubscriptionState::Pending
                )
            })
            .map(|(symbol, _)| symbol.clone())
            .collect();

        self.mark_pending(restore.iter(), now);
        restore
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        crate::model::datetime_from_epoch_ms(1_700_000_000_000)
    }

    #[test]
    fn test_mark_pending_increments_attempts_monotonically() {
        let mut map = SubscriptionMap::new();
        let symbol = Symbol::new("BTC-USDT");

        map.mark_pending([&symbol], now());
        assert_eq!(1, map.get(&symbol).unwrap().attempts);

        map.get_mut(&symbol)
            .unwrap()
            .mark(SubscriptionState::Failed, now());
        map.mark_pending([&symbol], now());
        assert_eq!(2, map.get(&symbol).unwrap().attempts);
    }

    #[test]
    fn test_rearm_for_reconnect_restores_subscribed_and_pending_union() {
        let mut map = SubscriptionMap::new();
        let subscribed = Symbol::new("BTC-USDT");
        let pending = Symbol::new("ETH-USDT");
        let failed = Symbol::new("SOL-USDT");

        map.mark_pending([&subscribed, &pending, &failed], now());
        map.get_mut(&subscribed)
            .unwrap()
            .mark(SubscriptionState::Subscribed, now());
        map.get_mut(&failed)
            .unwrap()
            .mark(SubscriptionState::Failed, now());

        let mut restored = map.rearm_for_reconnect(now());
        restored.sort();

        assert_eq!(vec![subscribed.clone(), pending.clone()], restored);
        assert_eq!(
            SubscriptionState::Pending,
            map.get(&subscribed).unwrap().state
        );
        assert_eq!(SubscriptionState::Failed, map.get(&failed).unwrap().state);
    }

    #[test]
    fn test_is_subscribed_admission_gate() {
        let mut map = SubscriptionMap::new();
        let symbol = Symbol::new("BTC-USDT");

        assert!(!map.is_subscribed(&symbol));
        map.mark_pending([&symbol], now());
        assert!(!map.is_subscribed(&symbol));
        map.get_mut(&symbol)
            .unwrap()
            .mark(SubscriptionState::Subscribed, now());
        assert!(map.is_subscribed(&symbol));
    }
}
