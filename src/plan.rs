//! Plan Lifecycle Manager.
//!
//! Tracks AI-proposed command plans from submission to a terminal state:
//!
//! ```text
//! draft -> pending_approval -> approved -> executing -> completed | failed
//!   \            \
//!    -> rejected   -> rejected
//! ```
//!
//! Approved plans enter a FIFO execution queue drained by the plan executor,
//! so at most one plan is executing at any time. The queue is unbounded: an
//! approved plan waits its turn. Stopping or replacing the session fails every
//! plan still waiting. Finished plans beyond the history limit are forgotten,
//! oldest first.

use crate::error::{EngineError, EngineResult};
use crate::policy::{self, RiskTier};
use crate::serializer::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    PendingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Rejected,
}

impl PlanStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step as proposed by the AI collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProposal {
    pub command: String,
    #[serde(default)]
    pub rationale: String,
    /// Risk label claimed by the proposer; informational only
    #[serde(default)]
    pub risk: Option<String>,
}

/// A plan as proposed by the AI collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanProposal {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    pub steps: Vec<StepProposal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub command: String,
    pub rationale: String,
    /// Tier assigned by the policy engine
    pub risk: RiskTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_risk: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    /// Why the plan was rejected or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Index of the step being executed, or the last one executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    pub created_at: u64,
    pub updated_at: u64,
}

pub struct PlanManager {
    plans: Mutex<HashMap<String, Plan>>,
    /// Submission order, for listing
    order: Mutex<Vec<String>>,
    /// Approved plans waiting for the executor
    queue: Mutex<VecDeque<String>>,
    queued_ids: Mutex<HashSet<String>>,
    /// Terminal plans kept for listing
    history: usize,
    notify: Notify,
    updates: broadcast::Sender<Plan>,
}

impl PlanManager {
    pub fn new(history: usize) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            plans: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            queued_ids: Mutex::new(HashSet::new()),
            history: history.max(1),
            notify: Notify::new(),
            updates,
        }
    }

    fn plans(&self) -> MutexGuard<'_, HashMap<String, Plan>> {
        self.plans.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every plan change is broadcast here
    pub fn subscribe(&self) -> broadcast::Receiver<Plan> {
        self.updates.subscribe()
    }

    /// Validate a proposal and file it.
    ///
    /// Invalid plans come back `rejected` with a reason; valid ones are
    /// `approved` (and queued) when `auto_approve`, else `pending_approval`.
    pub fn submit(&self, proposal: PlanProposal, auto_approve: bool) -> EngineResult<Plan> {
        let id = proposal
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.plans().contains_key(&id) {
            return Err(EngineError::PlanValidation {
                reason: format!("plan {id} already exists"),
            });
        }

        let now = current_timestamp_ms();
        let mut plan = Plan {
            id: id.clone(),
            title: proposal.title,
            steps: proposal
                .steps
                .into_iter()
                .enumerate()
                .map(|(index, step)| PlanStep {
                    index,
                    command: step.command.trim().to_string(),
                    rationale: step.rationale,
                    risk: RiskTier::High,
                    declared_risk: step.risk,
                })
                .collect(),
            status: PlanStatus::Draft,
            reason: None,
            current_step: None,
            created_at: now,
            updated_at: now,
        };
        debug!("Plan {} drafted with {} steps", id, plan.steps.len());

        match policy::validate_plan(plan.steps.iter().map(|s| s.command.as_str())) {
            Ok(verdicts) => {
                for (step, verdict) in plan.steps.iter_mut().zip(verdicts) {
                    step.risk = verdict.risk;
                }
                plan.status = if auto_approve {
                    PlanStatus::Approved
                } else {
                    PlanStatus::PendingApproval
                };
                info!("Plan {} accepted as {}", id, plan.status);
            }
            Err(EngineError::PlanValidation { reason }) => {
                warn!("Plan {} rejected: {}", id, reason);
                plan.status = PlanStatus::Rejected;
                plan.reason = Some(reason);
            }
            Err(e) => return Err(e),
        }

        self.plans().insert(id.clone(), plan.clone());
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id.clone());
        let _ = self.updates.send(plan.clone());
        self.prune_history();

        if plan.status == PlanStatus::Approved {
            self.enqueue(&id)?;
            return self.get(&id);
        }
        Ok(plan)
    }

    pub fn approve(&self, id: &str) -> EngineResult<Plan> {
        let plan = self.transition(id, &[PlanStatus::PendingApproval], PlanStatus::Approved, None)?;
        self.enqueue(id)?;
        Ok(plan)
    }

    pub fn reject(&self, id: &str, reason: Option<String>) -> EngineResult<Plan> {
        let reason = reason.unwrap_or_else(|| "rejected by operator".to_string());
        self.transition(
            id,
            &[PlanStatus::Draft, PlanStatus::PendingApproval],
            PlanStatus::Rejected,
            Some(reason),
        )
    }

    /// Move an approved plan to executing. At most one plan executes at a time.
    pub fn begin_execution(&self, id: &str) -> EngineResult<Plan> {
        let busy = self
            .plans()
            .values()
            .find(|p| p.status == PlanStatus::Executing && p.id != id)
            .map(|p| p.id.clone());
        if let Some(running) = busy {
            warn!("Plan {} must wait, plan {} is still executing", id, running);
            return Err(EngineError::InvalidPlanTransition {
                id: id.to_string(),
                from: PlanStatus::Approved.as_str(),
                to: PlanStatus::Executing.as_str(),
            });
        }
        self.transition(id, &[PlanStatus::Approved], PlanStatus::Executing, None)
    }

    pub fn step_started(&self, id: &str, index: usize) -> EngineResult<Plan> {
        let mut plans = self.plans();
        let plan = plans
            .get_mut(id)
            .ok_or_else(|| EngineError::PlanNotFound(id.to_string()))?;
        if plan.status != PlanStatus::Executing {
            return Err(EngineError::InvalidPlanTransition {
                id: id.to_string(),
                from: plan.status.as_str(),
                to: PlanStatus::Executing.as_str(),
            });
        }
        plan.current_step = Some(index);
        plan.updated_at = current_timestamp_ms();
        let plan = plan.clone();
        drop(plans);
        let _ = self.updates.send(plan.clone());
        Ok(plan)
    }

    pub fn complete(&self, id: &str) -> EngineResult<Plan> {
        self.transition(id, &[PlanStatus::Executing], PlanStatus::Completed, None)
    }

    /// Fail a queued or executing plan
    pub fn fail(&self, id: &str, reason: impl Into<String>) -> EngineResult<Plan> {
        self.transition(
            id,
            &[PlanStatus::Approved, PlanStatus::Executing],
            PlanStatus::Failed,
            Some(reason.into()),
        )
    }

    /// Fail whichever plan is executing (session stop). Returns its id.
    pub fn abort_executing(&self, reason: &str) -> Option<String> {
        let id = self
            .plans()
            .values()
            .find(|p| p.status == PlanStatus::Executing)
            .map(|p| p.id.clone())?;
        match self.transition(&id, &[PlanStatus::Executing], PlanStatus::Failed, Some(reason.to_string())) {
            Ok(_) => {
                warn!("Plan {} aborted: {}", id, reason);
                Some(id)
            }
            Err(_) => None,
        }
    }

    /// Fail every approved plan that has not started (session stop or
    /// replace). Returns their ids, oldest first.
    pub fn cancel_queued(&self, reason: &str) -> Vec<String> {
        self.queue().clear();
        let waiting: Vec<String> = self
            .list()
            .into_iter()
            .filter(|p| p.status == PlanStatus::Approved)
            .map(|p| p.id)
            .collect();

        waiting
            .into_iter()
            .filter(|id| {
                let failed = self
                    .transition(id, &[PlanStatus::Approved], PlanStatus::Failed, Some(reason.to_string()))
                    .is_ok();
                if failed {
                    warn!("Queued plan {} cancelled: {}", id, reason);
                }
                failed
            })
            .collect()
    }

    /// Drop the oldest terminal plans beyond the history limit
    fn prune_history(&self) {
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let mut plans = self.plans();
        let terminal = order
            .iter()
            .filter(|id| plans.get(*id).is_some_and(|p| p.status.is_terminal()))
            .count();
        let mut excess = terminal.saturating_sub(self.history);
        if excess == 0 {
            return;
        }

        order.retain(|id| {
            let finished = plans.get(id).is_some_and(|p| p.status.is_terminal());
            if excess > 0 && finished {
                excess -= 1;
                plans.remove(id);
                debug!("Plan {} dropped from history", id);
                false
            } else {
                true
            }
        });
    }

    pub fn get(&self, id: &str) -> EngineResult<Plan> {
        self.plans()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::PlanNotFound(id.to_string()))
    }

    /// All plans, oldest first
    pub fn list(&self) -> Vec<Plan> {
        let order = self.order.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let plans = self.plans();
        order.iter().filter_map(|id| plans.get(id).cloned()).collect()
    }

    pub fn status_of(&self, id: &str) -> Option<PlanStatus> {
        self.plans().get(id).map(|p| p.status)
    }

    /// Number of approved plans waiting for the executor
    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    fn enqueue(&self, id: &str) -> EngineResult<()> {
        {
            let mut seen = self.queued_ids.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert(id.to_string()) {
                debug!("Plan {} already queued", id);
                return Ok(());
            }
        }

        let mut queue = self.queue();
        queue.push_back(id.to_string());
        debug!("Plan {} queued, queue size: {}", id, queue.len());
        drop(queue);

        self.notify.notify_one();
        Ok(())
    }

    /// Next approved plan id, oldest first, without waiting
    pub fn dequeue(&self) -> Option<String> {
        self.queue().pop_front()
    }

    /// Wait for an approved plan and take it off the queue
    pub async fn wait_and_dequeue(&self) -> String {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.dequeue() {
                return id;
            }
            notified.await;
        }
    }

    fn transition(
        &self,
        id: &str,
        from: &[PlanStatus],
        to: PlanStatus,
        reason: Option<String>,
    ) -> EngineResult<Plan> {
        let mut plans = self.plans();
        let plan = plans
            .get_mut(id)
            .ok_or_else(|| EngineError::PlanNotFound(id.to_string()))?;
        if !from.contains(&plan.status) {
            return Err(EngineError::InvalidPlanTransition {
                id: id.to_string(),
                from: plan.status.as_str(),
                to: to.as_str(),
            });
        }
        debug!("Plan {}: {} -> {}", id, plan.status, to);
        plan.status = to;
        if reason.is_some() {
            plan.reason = reason;
        }
        plan.updated_at = current_timestamp_ms();
        let plan = plan.clone();
        drop(plans);

        if to.is_terminal() {
            self.queued_ids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
        }
        let _ = self.updates.send(plan.clone());
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn proposal(commands: &[&str]) -> PlanProposal {
        PlanProposal {
            id: None,
            title: "test plan".to_string(),
            steps: commands
                .iter()
                .map(|c| StepProposal {
                    command: c.to_string(),
                    rationale: String::new(),
                    risk: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_valid_plan_waits_for_approval() {
        let m = PlanManager::new(8);
        let plan = m.submit(proposal(&["mkdir demo", "ls -la"]), false).unwrap();
        assert_eq!(plan.status, PlanStatus::PendingApproval);
        assert_eq!(plan.steps[0].risk, RiskTier::Medium);
        assert_eq!(plan.steps[1].risk, RiskTier::Low);
        assert_eq!(m.queued(), 0);

        let plan = m.approve(&plan.id).unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
        assert_eq!(m.dequeue(), Some(plan.id));
    }

    #[test]
    fn test_auto_approve_skips_pending() {
        let m = PlanManager::new(8);
        let plan = m.submit(proposal(&["mkdir demo"]), true).unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
        assert_eq!(m.queued(), 1);
    }

    #[test]
    fn test_oversized_plan_is_rejected() {
        let m = PlanManager::new(8);
        let commands: Vec<String> = (0..16).map(|i| format!("mkdir dir{i}")).collect();
        let refs: Vec<&str> = commands.iter().map(String::as_str).collect();

        let plan = m.submit(proposal(&refs), true).unwrap();
        assert_eq!(plan.status, PlanStatus::Rejected);
        assert!(plan.reason.unwrap().contains("16 steps"));
        assert_eq!(m.queued(), 0);
    }

    #[test]
    fn test_blocked_step_rejects_whole_plan() {
        let m = PlanManager::new(8);
        let plan = m.submit(proposal(&["ls", "sudo rm -rf /"]), true).unwrap();
        assert_eq!(plan.status, PlanStatus::Rejected);
        assert!(plan.reason.unwrap().contains("step 2"));
    }

    #[test]
    fn test_reject_and_invalid_transitions() {
        let m = PlanManager::new(8);
        let plan = m.submit(proposal(&["ls"]), false).unwrap();
        let rejected = m.reject(&plan.id, None).unwrap();
        assert_eq!(rejected.status, PlanStatus::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("rejected by operator"));

        match m.approve(&plan.id) {
            Err(EngineError::InvalidPlanTransition { from, to, .. }) => {
                assert_eq!(from, "rejected");
                assert_eq!(to, "approved");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(m.approve("nope"), Err(EngineError::PlanNotFound(_))));
    }

    #[test]
    fn test_duplicate_id_is_refused() {
        let m = PlanManager::new(8);
        let mut p = proposal(&["ls"]);
        p.id = Some("fixed".to_string());
        m.submit(p.clone(), false).unwrap();
        assert!(matches!(
            m.submit(p, false),
            Err(EngineError::PlanValidation { .. })
        ));
    }

    #[test]
    fn test_execution_lifecycle_and_abort() {
        let m = PlanManager::new(8);
        let a = m.submit(proposal(&["ls"]), true).unwrap();
        let b = m.submit(proposal(&["pwd"]), true).unwrap();

        assert_eq!(m.dequeue().as_deref(), Some(a.id.as_str()));
        m.begin_execution(&a.id).unwrap();
        // Only one plan executes at a time
        assert!(m.begin_execution(&b.id).is_err());

        m.step_started(&a.id, 0).unwrap();
        assert_eq!(m.abort_executing("session stopped"), Some(a.id.clone()));
        let a = m.get(&a.id).unwrap();
        assert_eq!(a.status, PlanStatus::Failed);
        assert_eq!(a.reason.as_deref(), Some("session stopped"));
        assert_eq!(m.abort_executing("session stopped"), None);

        assert_eq!(m.dequeue().as_deref(), Some(b.id.as_str()));
        m.begin_execution(&b.id).unwrap();
        assert_eq!(m.complete(&b.id).unwrap().status, PlanStatus::Completed);
        assert_eq!(m.list().len(), 2);
    }

    #[test]
    fn test_approved_plans_wait_their_turn() {
        let m = PlanManager::new(2);
        let ids: Vec<String> = (0..12)
            .map(|i| m.submit(proposal(&[format!("mkdir dir{i}").as_str()]), true).unwrap().id)
            .collect();

        assert_eq!(m.queued(), 12);
        assert!(ids
            .iter()
            .all(|id| m.status_of(id) == Some(PlanStatus::Approved)));
        for id in &ids {
            assert_eq!(m.dequeue().as_ref(), Some(id));
        }
    }

    #[test]
    fn test_cancel_queued_fails_waiting_plans_only() {
        let m = PlanManager::new(8);
        let running = m.submit(proposal(&["ls"]), true).unwrap();
        let waiting = m.submit(proposal(&["pwd"]), true).unwrap();
        let pending = m.submit(proposal(&["whoami"]), false).unwrap();

        assert_eq!(m.dequeue().as_deref(), Some(running.id.as_str()));
        m.begin_execution(&running.id).unwrap();

        assert_eq!(m.cancel_queued("session stopped"), vec![waiting.id.clone()]);
        assert_eq!(m.queued(), 0);
        let waiting = m.get(&waiting.id).unwrap();
        assert_eq!(waiting.status, PlanStatus::Failed);
        assert_eq!(waiting.reason.as_deref(), Some("session stopped"));
        assert_eq!(m.status_of(&running.id), Some(PlanStatus::Executing));
        assert_eq!(m.status_of(&pending.id), Some(PlanStatus::PendingApproval));

        // A plan taken off the queue but not yet started cannot start any more
        let late = m.submit(proposal(&["date"]), true).unwrap();
        assert_eq!(m.dequeue().as_deref(), Some(late.id.as_str()));
        assert_eq!(m.cancel_queued("session replaced"), vec![late.id.clone()]);
        assert!(m.begin_execution(&late.id).is_err());
    }

    #[test]
    fn test_finished_plans_are_pruned_beyond_history() {
        let m = PlanManager::new(3);
        let pending = m.submit(proposal(&["ls"]), false).unwrap();
        let rejected: Vec<String> = (0..5)
            .map(|_| m.submit(proposal(&["sudo reboot"]), true).unwrap().id)
            .collect();

        let plans = m.list();
        assert_eq!(plans.len(), 4);
        assert_eq!(plans[0].id, pending.id);
        // Oldest finished plans went first
        assert!(m.get(&rejected[0]).is_err());
        assert!(m.get(&rejected[1]).is_err());
        assert!(m.get(&rejected[4]).is_ok());
        assert_eq!(
            plans.iter().filter(|p| p.status.is_terminal()).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_wait_and_dequeue_wakes_on_approval() {
        let m = std::sync::Arc::new(PlanManager::new(8));
        let plan = m.submit(proposal(&["ls"]), false).unwrap();

        let waiter = {
            let m = m.clone();
            tokio::spawn(async move { m.wait_and_dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        m.approve(&plan.id).unwrap();
        let id = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, plan.id);
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let m = PlanManager::new(8);
        let mut rx = m.subscribe();
        let plan = m.submit(proposal(&["ls"]), false).unwrap();
        m.approve(&plan.id).unwrap();

        assert_eq!(rx.recv().await.unwrap().status, PlanStatus::PendingApproval);
        assert_eq!(rx.recv().await.unwrap().status, PlanStatus::Approved);
    }
}
