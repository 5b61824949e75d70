//! Budget and cost accounting (spec.md §4.9).
//!
//! Accumulators are in-memory and best-effort durable: if the process
//! crashes, budgets reset. This is acceptable because the host session
//! ending reclaims state (spec.md §4.9).

use std::collections::HashMap;
use std::sync::RwLock;

use rust_decimal::Decimal;

use crate::agent::AgentKind;
use crate::error::BudgetExhausted;

/// Per-call and per-session spending caps for one agent kind.
#[derive(Debug, Clone, Copy)]
pub struct BudgetCaps {
    pub per_call_usd: Decimal,
    pub per_session_usd: Decimal,
}

impl BudgetCaps {
    pub fn new(per_call_usd: Decimal, per_session_usd: Decimal) -> Self {
        Self {
            per_call_usd,
            per_session_usd,
        }
    }
}

/// Tracks cumulative USD spend per agent kind and session-wide, and enforces
/// hard caps before each call (spec.md §4.9).
pub struct BudgetTracker {
    caps: HashMap<AgentKind, BudgetCaps>,
    session_cap: Decimal,
    spent_by_kind: RwLock<HashMap<AgentKind, Decimal>>,
    spent_session: RwLock<Decimal>,
}

impl BudgetTracker {
    pub fn new(caps: HashMap<AgentKind, BudgetCaps>, session_cap: Decimal) -> Self {
        Self {
            caps,
            session_cap,
            spent_by_kind: RwLock::new(HashMap::new()),
            spent_session: RwLock::new(Decimal::ZERO),
        }
    }

    /// Check remaining budget before dispatching a call of `kind`.
    ///
    /// Per spec.md §4.2: "Respect a per-call spending cap" and "Respect a
    /// per-kind session cap; if exhausted, further calls of that kind fail
    /// with BudgetExhausted".
    pub fn check(&self, kind: AgentKind) -> Result<(), BudgetExhausted> {
        let session_spent = *self.spent_session.read().expect("lock poisoned");
        if session_spent >= self.session_cap {
            return Err(BudgetExhausted::PerSession);
        }

        if let Some(caps) = self.caps.get(&kind) {
            let kind_spent = self
                .spent_by_kind
                .read()
                .expect("lock poisoned")
                .get(&kind)
                .copied()
                .unwrap_or(Decimal::ZERO);

            if kind_spent >= caps.per_session_usd {
                return Err(BudgetExhausted::PerSession);
            }
        }

        Ok(())
    }

    /// Record actual spend after a call completes (spec.md §4.2 step 4:
    /// "Report cost; add to per-kind and session-wide accumulators").
    pub fn record(&self, kind: AgentKind, cost: Decimal) {
        *self
            .spent_by_kind
            .write()
            .expect("lock poisoned")
            .entry(kind)
            .or_insert(Decimal::ZERO) += cost;
        *self.spent_session.write().expect("lock poisoned") += cost;
    }

    pub fn session_spent(&self) -> Decimal {
        *self.spent_session.read().expect("lock poisoned")
    }

    pub fn kind_spent(&self, kind: AgentKind) -> Decimal {
        self.spent_by_kind
            .read()
            .expect("lock poisoned")
            .get(&kind)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// `true` once the session-wide cap has been reached, signalling the
    /// lifecycle controller to initiate shutdown(cause=budget).
    pub fn session_exhausted(&self) -> bool {
        self.session_spent() >= self.session_cap
    }

    pub fn caps_for(&self, kind: AgentKind) -> Option<BudgetCaps> {
        self.caps.get(&kind).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tracker() -> BudgetTracker {
        let mut caps = HashMap::new();
        caps.insert(
            AgentKind::RetrieverA,
            BudgetCaps::new(dec!(0.10), dec!(5.00)),
        );
        BudgetTracker::new(caps, dec!(10.00))
    }

    #[test]
    fn allows_calls_under_cap() {
        let t = tracker();
        assert!(t.check(AgentKind::RetrieverA).is_ok());
    }

    #[test]
    fn per_kind_session_cap_exhausts() {
        let t = tracker();
        t.record(AgentKind::RetrieverA, dec!(5.00));
        assert_eq!(
            t.check(AgentKind::RetrieverA),
            Err(BudgetExhausted::PerSession)
        );
    }

    #[test]
    fn session_wide_cap_exhausts_regardless_of_kind() {
        let t = tracker();
        t.record(AgentKind::Learner, dec!(10.00));
        assert!(t.session_exhausted());
        assert_eq!(
            t.check(AgentKind::RetrieverA),
            Err(BudgetExhausted::PerSession)
        );
    }

    #[test]
    fn unbudgeted_kind_only_bound_by_session_cap() {
        let t = tracker();
        assert!(t.check(AgentKind::Compactor).is_ok());
    }
}
