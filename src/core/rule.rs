//! Scheduling rules: declarative resource footprints used for conflict
//! detection between jobs.
//!
//! Two jobs may run concurrently unless their rules conflict. Rules form a
//! pairwise, not necessarily transitive, relation; the resolver only ever
//! asks the symmetric question answered by [`rules_conflict`].

use std::any::Any;
use std::sync::Arc;

/// A value describing a unit of work's resource footprint.
///
/// Implementations must be cheap to query; `contains` and `is_conflicting`
/// are consulted under the scheduler's coordinator lock.
///
/// The default implementations make a rule relate only to itself: identity
/// comparison is handled by the free helpers below, so a bare
/// `impl SchedulingRule` conflicts with nothing but its own `Arc`.
pub trait SchedulingRule: Send + Sync {
    /// Returns whether this rule completely encloses `other`.
    ///
    /// Used for reentrant nesting: a thread already holding a rule may begin
    /// any rule contained in it.
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        let _ = other;
        false
    }

    /// Returns whether this rule and `other` must not be held concurrently.
    ///
    /// Only one direction needs to report a conflict; the resolver checks
    /// both sides.
    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
        let _ = other;
        false
    }

    /// Concrete-type access for rules (such as [`MultiRule`]) that need to
    /// inspect the structure of their peers.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a scheduling rule.
pub type RuleRef = Arc<dyn SchedulingRule>;

/// Symmetric conflict check between two rule handles.
///
/// A rule always conflicts with itself (same allocation); otherwise the two
/// rules conflict if either side reports a conflict with the other.
#[must_use]
pub fn rules_conflict(a: &RuleRef, b: &RuleRef) -> bool {
    Arc::ptr_eq(a, b) || a.is_conflicting(b.as_ref()) || b.is_conflicting(a.as_ref())
}

/// Returns whether `outer` encloses `inner` (identity counts as containment).
#[must_use]
pub fn rule_contains(outer: &RuleRef, inner: &RuleRef) -> bool {
    Arc::ptr_eq(outer, inner) || outer.contains(inner.as_ref())
}

/// The simplest rule: conflicts only with itself (or a rule that contains it).
///
/// Useful as a plain mutual-exclusion token between jobs.
#[derive(Debug, Default)]
pub struct IdentityRule;

impl IdentityRule {
    /// Create a fresh identity rule as a shared handle.
    #[must_use]
    pub fn new() -> RuleRef {
        Arc::new(Self)
    }
}

impl SchedulingRule for IdentityRule {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A rule combining several child rules.
///
/// Conflicts with anything any child conflicts with, and contains another
/// rule when some child contains it (or, for another `MultiRule`, when every
/// child of the other is contained here).
pub struct MultiRule {
    children: Vec<RuleRef>,
}

impl MultiRule {
    /// Combine rules into one. `None` entries are skipped; a single
    /// surviving rule is returned unwrapped.
    #[must_use]
    pub fn combine(rules: Vec<Option<RuleRef>>) -> Option<RuleRef> {
        let mut children: Vec<RuleRef> = rules.into_iter().flatten().collect();
        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(Arc::new(Self { children })),
        }
    }

    /// The child rules of this combination.
    #[must_use]
    pub fn children(&self) -> &[RuleRef] {
        &self.children
    }
}

impl SchedulingRule for MultiRule {
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        if let Some(multi) = other.as_any().downcast_ref::<Self>() {
            multi
                .children
                .iter()
                .all(|inner| self.children.iter().any(|c| rule_contains(c, inner)))
        } else {
            self.children.iter().any(|c| c.contains(other))
        }
    }

    fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
        self.children
            .iter()
            .any(|c| c.is_conflicting(other) || other.is_conflicting(c.as_ref()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
