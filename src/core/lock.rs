//! Implicit rule locking: the held-rule table shared by the resolver and the
//! `begin_rule`/`end_rule` primitive.
//!
//! The table lives inside the manager's coordinator lock. Rules are held
//! either by a dispatched job or by an arbitrary thread that entered an
//! implicit critical section; the same thread may nest acquisitions of
//! contained rules, tracked with a reentrancy depth.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use tracing::warn;

use crate::core::error::JobError;
use crate::core::job::JobId;
use crate::core::manager::{self, ManagerCore};
use crate::core::rule::{rule_contains, rules_conflict, RuleRef};

/// Observer of implicit-lock wait points.
///
/// A host environment installs one listener per manager to be told whenever a
/// thread is about to block on a rule (including inside `join`), so it can
/// yield, pump an event loop, or detect deadlock risk on a thread that must
/// not park.
pub trait LockListener: Send + Sync {
    /// A thread is about to block; `lock_owner` is the thread currently
    /// holding a conflicting rule, when known.
    fn about_to_wait(&self, lock_owner: Option<ThreadId>) {
        let _ = lock_owner;
    }

    /// Whether the current thread may park indefinitely. Returning `false`
    /// makes the resolver poll in short timed waits, re-consulting this
    /// listener every round.
    fn can_block(&self) -> bool {
        true
    }

    /// The wait has ended (the rule was acquired or the join completed).
    fn about_to_release(&self) {}
}

/// Who holds a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RuleOwner {
    Job(JobId),
    Thread(ThreadId),
}

#[derive(Clone)]
pub(crate) struct HeldRule {
    id: u64,
    pub(crate) rule: RuleRef,
    pub(crate) owner: RuleOwner,
    /// Thread currently executing on behalf of the owner; lets that thread
    /// nest contained `begin_rule` acquisitions.
    owner_tid: Option<ThreadId>,
    depth: u32,
}

impl HeldRule {
    /// Thread currently executing on behalf of the owner, when known.
    pub(crate) fn owner_thread(&self) -> Option<ThreadId> {
        self.owner_tid
    }
}

struct StackEntry {
    rule: RuleRef,
    /// Held entry this acquisition references; `None` when covered by a
    /// job-owned rule (nothing to decrement on exit).
    held_id: Option<u64>,
}

/// Bookkeeping for held rules, per-thread nesting stacks, and threads
/// currently blocked waiting for a rule. All access is serialized by the
/// manager's coordinator lock.
#[derive(Default)]
pub(crate) struct RuleTable {
    held: Vec<HeldRule>,
    stacks: HashMap<ThreadId, Vec<StackEntry>>,
    blocked: Vec<(ThreadId, RuleRef)>,
    next_id: u64,
}

impl RuleTable {
    /// First held rule conflicting with `rule` that is not owned (or
    /// executed) by `tid`.
    pub(crate) fn conflicting_for_thread(
        &self,
        rule: &RuleRef,
        tid: ThreadId,
    ) -> Option<&HeldRule> {
        self.held.iter().find(|h| {
            h.owner_tid != Some(tid)
                && h.owner != RuleOwner::Thread(tid)
                && rules_conflict(&h.rule, rule)
        })
    }

    /// Whether any held rule conflicts with `rule` (job admission check;
    /// the candidate job holds nothing yet, so no exemptions apply).
    pub(crate) fn conflicts_any(&self, rule: &RuleRef) -> bool {
        self.held.iter().any(|h| rules_conflict(&h.rule, rule))
    }

    /// Record `rule` as held by a dispatched job.
    pub(crate) fn acquire_job(&mut self, job: JobId, rule: RuleRef) {
        self.next_id += 1;
        self.held.push(HeldRule {
            id: self.next_id,
            rule,
            owner: RuleOwner::Job(job),
            owner_tid: None,
            depth: 1,
        });
    }

    /// Bind or unbind the thread executing a job's rule, enabling nested
    /// implicit acquisitions from the work function.
    pub(crate) fn set_job_thread(&mut self, job: JobId, tid: Option<ThreadId>) {
        for h in &mut self.held {
            if h.owner == RuleOwner::Job(job) {
                h.owner_tid = tid;
            }
        }
    }

    /// Release the rule held by a finishing job. Returns whether anything
    /// was released (callers notify waiters only then).
    pub(crate) fn release_job(&mut self, job: JobId) -> bool {
        let before = self.held.len();
        self.held.retain(|h| h.owner != RuleOwner::Job(job));
        self.held.len() != before
    }

    /// Try to satisfy `begin_rule` without waiting through nesting: a rule
    /// contained in one this thread already holds (directly or through the
    /// job it is running) is granted immediately.
    ///
    /// # Errors
    ///
    /// If the thread holds an unrelated rule, the acquisition is rejected
    /// rather than risking deadlock.
    pub(crate) fn try_nest(
        &mut self,
        tid: ThreadId,
        rule: &RuleRef,
    ) -> Result<bool, JobError> {
        let Some(covering) = self
            .held
            .iter_mut()
            .find(|h| {
                (h.owner == RuleOwner::Thread(tid) || h.owner_tid == Some(tid))
                    && rule_contains(&h.rule, rule)
            })
        else {
            // An unrelated rule on this thread's stack makes the new
            // acquisition illegal, not merely contended.
            if self.stacks.get(&tid).is_some_and(|s| !s.is_empty()) {
                return Err(JobError::RuleMismatch(
                    "begin_rule of a rule not contained in the rule this thread already holds"
                        .into(),
                ));
            }
            return Ok(false);
        };

        let held_id = match covering.owner {
            RuleOwner::Thread(_) => {
                covering.depth += 1;
                Some(covering.id)
            }
            RuleOwner::Job(_) => None,
        };
        self.stacks.entry(tid).or_default().push(StackEntry {
            rule: Arc::clone(rule),
            held_id,
        });
        Ok(true)
    }

    /// Record `rule` as held by `tid` after the wait loop admitted it.
    pub(crate) fn acquire_thread(&mut self, tid: ThreadId, rule: RuleRef) {
        self.next_id += 1;
        let id = self.next_id;
        self.held.push(HeldRule {
            id,
            rule: Arc::clone(&rule),
            owner: RuleOwner::Thread(tid),
            owner_tid: Some(tid),
            depth: 1,
        });
        self.stacks
            .entry(tid)
            .or_default()
            .push(StackEntry { rule, held_id: Some(id) });
    }

    /// Undo the innermost `begin_rule` on `tid`. Returns whether a held
    /// entry was fully released (waiters need waking only then).
    pub(crate) fn release_thread(
        &mut self,
        tid: ThreadId,
        rule: &RuleRef,
    ) -> Result<bool, JobError> {
        let stack = self.stacks.get_mut(&tid).filter(|s| !s.is_empty()).ok_or_else(|| {
            JobError::RuleMismatch("end_rule without a matching begin_rule".into())
        })?;
        let top = stack.last().is_some_and(|e| Arc::ptr_eq(&e.rule, rule));
        if !top {
            return Err(JobError::RuleMismatch(
                "end_rule does not match the innermost begin_rule".into(),
            ));
        }
        let entry = stack.pop().ok_or_else(|| {
            JobError::RuleMismatch("end_rule without a matching begin_rule".into())
        })?;
        if stack.is_empty() {
            self.stacks.remove(&tid);
        }
        let Some(held_id) = entry.held_id else {
            return Ok(false);
        };
        let Some(pos) = self.held.iter().position(|h| h.id == held_id) else {
            return Ok(false);
        };
        self.held[pos].depth -= 1;
        if self.held[pos].depth == 0 {
            self.held.remove(pos);
            return Ok(true);
        }
        Ok(false)
    }

    /// Track a thread entering/leaving the blocked set of `begin_rule`.
    pub(crate) fn mark_blocked(&mut self, tid: ThreadId, rule: RuleRef) {
        self.blocked.push((tid, rule));
    }

    pub(crate) fn unmark_blocked(&mut self, tid: ThreadId) {
        if let Some(pos) = self.blocked.iter().rposition(|(t, _)| *t == tid) {
            self.blocked.remove(pos);
        }
    }

    /// Whether a thread blocked in an implicit acquisition needs `rule`.
    pub(crate) fn blocked_thread_conflicts(&self, rule: &RuleRef) -> bool {
        self.blocked.iter().any(|(_, r)| rules_conflict(r, rule))
    }

    /// Number of rules currently held (jobs and threads combined).
    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Scoped implicit-lock acquisition; releases its rule on drop on all exit
/// paths. Obtained from [`JobManager::acquire_rule`].
///
/// [`JobManager::acquire_rule`]: crate::core::JobManager::acquire_rule
pub struct RuleGuard {
    pub(crate) manager: Arc<ManagerCore>,
    pub(crate) rule: Option<RuleRef>,
}

impl Drop for RuleGuard {
    fn drop(&mut self) {
        if let Some(rule) = self.rule.take() {
            if let Err(e) = manager::end_rule(&self.manager, &rule) {
                warn!(error = %e, "rule guard drop failed to release rule");
            }
        }
    }
}
