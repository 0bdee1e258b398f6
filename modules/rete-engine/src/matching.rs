//! Match / Token model.
//!
//! A `Match` is a query result value together with its `Support`: the
//! provenance tree of facts (and computations) it was derived from. Equality
//! and hashing are structural over (value, support), which is how duplicate
//! results and retractions are recognised.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rete_store::{Snapshot, Triple};

/// Bound on every value flowing through a query.
pub trait QueryValue: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> QueryValue for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
    /// The support includes computed state that cannot be checked against a
    /// snapshot alone; only the engine's propagation can decide.
    Inconclusive,
}

/// Opaque tag attached with `Match::bind` and recovered with `Match::bound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindKey(u64);

impl BindKey {
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Support
// ---------------------------------------------------------------------------

/// Type-erased provenance of a match.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Support(Arc<SupportNode>);

#[derive(Debug, PartialEq, Eq, Hash)]
enum SupportNode {
    Constant,
    Datom(Triple),
    /// Produced by a stateful operator (reductions, distinct); identified by
    /// the operator instance.
    Computed(u64),
    Combined(Support, Support),
    Bound(BindKey, Support),
}

impl Support {
    pub fn constant() -> Self {
        Self(Arc::new(SupportNode::Constant))
    }

    pub fn datom(triple: Triple) -> Self {
        Self(Arc::new(SupportNode::Datom(triple)))
    }

    pub(crate) fn computed(origin: u64) -> Self {
        Self(Arc::new(SupportNode::Computed(origin)))
    }

    pub fn combine(&self, other: &Support) -> Self {
        Self(Arc::new(SupportNode::Combined(self.clone(), other.clone())))
    }

    fn bind(&self, key: BindKey) -> Self {
        Self(Arc::new(SupportNode::Bound(key, self.clone())))
    }

    /// Check every supporting fact against `db`. Invalid wins over
    /// Inconclusive.
    pub fn validate(&self, db: &dyn Snapshot) -> Validity {
        let mut result = Validity::Valid;
        let mut stack = vec![self];
        while let Some(support) = stack.pop() {
            match &*support.0 {
                SupportNode::Constant => {}
                SupportNode::Datom(triple) => {
                    if !db.contains(triple) {
                        return Validity::Invalid;
                    }
                }
                SupportNode::Computed(_) => result = Validity::Inconclusive,
                SupportNode::Combined(a, b) => {
                    stack.push(a);
                    stack.push(b);
                }
                SupportNode::Bound(_, inner) => stack.push(inner),
            }
        }
        result
    }

    /// The support that was tagged with `key`, if any.
    pub fn bound(&self, key: BindKey) -> Option<Support> {
        let mut stack = vec![self];
        while let Some(support) = stack.pop() {
            match &*support.0 {
                SupportNode::Bound(k, inner) if *k == key => return Some(inner.clone()),
                SupportNode::Bound(_, inner) => stack.push(inner),
                SupportNode::Combined(a, b) => {
                    stack.push(b);
                    stack.push(a);
                }
                _ => {}
            }
        }
        None
    }

    /// Every fact this support rests on.
    pub fn datoms(&self) -> Vec<Triple> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(support) = stack.pop() {
            match &*support.0 {
                SupportNode::Datom(t) => out.push(t.clone()),
                SupportNode::Combined(a, b) => {
                    stack.push(b);
                    stack.push(a);
                }
                SupportNode::Bound(_, inner) => stack.push(inner),
                SupportNode::Constant | SupportNode::Computed(_) => {}
            }
        }
        out
    }
}

impl fmt::Debug for Support {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            SupportNode::Constant => write!(f, "const"),
            SupportNode::Datom(t) => write!(f, "[{} {} {:?}]", t.entity, t.attribute, t.value),
            SupportNode::Computed(origin) => write!(f, "computed#{origin}"),
            SupportNode::Combined(a, b) => write!(f, "({a:?} + {b:?})"),
            SupportNode::Bound(key, inner) => write!(f, "bind#{}({inner:?})", key.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Match / Token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Match<T> {
    value: T,
    support: Support,
}

impl<T> Match<T> {
    pub fn new(value: T, support: Support) -> Self {
        Self { value, support }
    }

    pub fn constant(value: T) -> Self {
        Self::new(value, Support::constant())
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn support(&self) -> &Support {
        &self.support
    }

    /// A new value resting on the same provenance.
    pub fn derive<U>(&self, value: U) -> Match<U> {
        Match {
            value,
            support: self.support.clone(),
        }
    }

    /// Join two matches; the result rests on both provenances.
    pub fn combine<U, V>(&self, other: &Match<U>, f: impl FnOnce(&T, &U) -> V) -> Match<V> {
        Match {
            value: f(&self.value, &other.value),
            support: self.support.combine(&other.support),
        }
    }

    pub fn bind(self, key: BindKey) -> Self {
        Self {
            support: self.support.bind(key),
            value: self.value,
        }
    }

    pub fn bound(&self, key: BindKey) -> Option<Support> {
        self.support.bound(key)
    }

    pub fn validate(&self, db: &dyn Snapshot) -> Validity {
        self.support.validate(db)
    }
}

impl Match<Triple> {
    pub fn datom(triple: Triple) -> Self {
        Self {
            support: Support::datom(triple.clone()),
            value: triple,
        }
    }
}

/// One assertion or retraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<T> {
    pub added: bool,
    pub item: Match<T>,
}

impl<T> Token<T> {
    pub fn added(item: Match<T>) -> Self {
        Self { added: true, item }
    }

    pub fn retracted(item: Match<T>) -> Self {
        Self { added: false, item }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rete_store::{Datom, EntityId, MemorySnapshot};

    fn db_with(datoms: &[Datom]) -> MemorySnapshot {
        MemorySnapshot::empty().apply(datoms).0
    }

    #[test]
    fn equality_is_structural_over_value_and_support() {
        let t = Triple::new(EntityId(1), "name", "a");
        let a = Match::datom(t.clone()).derive("x");
        let b = Match::datom(t).derive("x");
        assert_eq!(a, b);

        let other = Match::datom(Triple::new(EntityId(2), "name", "a")).derive("x");
        assert_ne!(a, other);
    }

    #[test]
    fn validate_checks_every_supporting_fact() {
        let t1 = Triple::new(EntityId(1), "name", "a");
        let t2 = Triple::new(EntityId(2), "name", "b");
        let db = db_with(&[Datom::add(EntityId(1), "name", "a")]);

        let m1 = Match::datom(t1.clone());
        let joined = m1.combine(&Match::datom(t2), |a, b| (a.clone(), b.clone()));
        assert_eq!(m1.validate(&db), Validity::Valid);
        assert_eq!(joined.validate(&db), Validity::Invalid);
    }

    #[test]
    fn computed_support_is_inconclusive_unless_invalid() {
        let db = db_with(&[]);
        let computed = Match::new(3, Support::computed(7));
        assert_eq!(computed.validate(&db), Validity::Inconclusive);

        let missing = Match::datom(Triple::new(EntityId(1), "n", 1i64));
        let both = computed.combine(&missing, |a, _| *a);
        assert_eq!(both.validate(&db), Validity::Invalid);
    }

    #[test]
    fn bound_support_is_recoverable_after_derivation() {
        let key = BindKey::fresh();
        let origin = Match::datom(Triple::new(EntityId(1), "name", "a"));
        let tagged = origin.clone().bind(key);
        let derived = tagged
            .derive(42)
            .combine(&Match::constant("c"), |n, _| *n);

        assert_eq!(derived.bound(key), Some(origin.support().clone()));
        assert_eq!(derived.bound(BindKey::fresh()), None);
        assert_eq!(derived.support().datoms().len(), 1);
    }
}
