//! Registry of running switches on one node

use crate::error::{Result, SwitchError};
use crate::plan::PlanId;
use crate::switch::Switch;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Finding {
    seq: u64,
    plan: PlanId,
    tx: oneshot::Sender<Arc<Switch>>,
}

#[derive(Default)]
struct State {
    switches: HashMap<PlanId, Arc<Switch>>,
    findings: Vec<Finding>,
    next_seq: u64,
}

/// Maps plan ids to the switch running them here.
///
/// A lookup for a plan that is not registered yet parks as a finding and is
/// completed by the `add` that registers it.
#[derive(Default)]
pub struct Manager {
    state: Mutex<State>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a switch and complete every finding waiting for its plan
    pub fn add(&self, switch: Arc<Switch>) -> Result<()> {
        let id = switch.id().clone();
        let waiting = {
            let mut state = self.state.lock();
            if state.switches.contains_key(&id) {
                return Err(SwitchError::InvalidPlan(format!(
                    "plan {} is already registered",
                    id
                )));
            }
            state.switches.insert(id.clone(), switch.clone());
            let (waiting, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.findings)
                .into_iter()
                .partition(|f| f.plan == id);
            state.findings = rest;
            waiting
        };

        debug!(plan = %id, woken = waiting.len(), "switch registered");
        for finding in waiting {
            let _ = finding.tx.send(switch.clone());
        }
        Ok(())
    }

    /// Unregister `switch`. A different instance under the same plan id is
    /// left alone, and removing twice is a no-op.
    pub fn remove(&self, switch: &Arc<Switch>) {
        let mut state = self.state.lock();
        let registered = state
            .switches
            .get(switch.id())
            .is_some_and(|current| Arc::ptr_eq(current, switch));
        if registered {
            state.switches.remove(switch.id());
            debug!(plan = %switch.id(), "switch removed");
        }
    }

    pub fn find_by_id(&self, id: &PlanId) -> Option<Arc<Switch>> {
        self.state.lock().switches.get(id).cloned()
    }

    /// Look up a switch, waiting for it to be added if needed.
    ///
    /// Returns `Cancelled` once `cancel` fires; the pending finding is
    /// removed whichever way the wait ends.
    pub async fn find_by_id_contexted(
        &self,
        id: &PlanId,
        cancel: &CancellationToken,
    ) -> Result<Arc<Switch>> {
        let (seq, rx) = {
            let mut state = self.state.lock();
            if let Some(switch) = state.switches.get(id) {
                return Ok(switch.clone());
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            state.findings.push(Finding {
                seq,
                plan: id.clone(),
                tx,
            });
            (seq, rx)
        };
        let _guard = FindingGuard { manager: self, seq };

        tokio::select! {
            found = rx => found.map_err(|_| SwitchError::Cancelled),
            _ = cancel.cancelled() => Err(SwitchError::Cancelled),
        }
    }

    /// Like [`Manager::find_by_id_contexted`] with a deadline.
    /// Expiry reports `SwitchNotFound`.
    pub async fn find_by_id_timeout(&self, id: &PlanId, timeout: Duration) -> Result<Arc<Switch>> {
        let never = CancellationToken::new();
        match tokio::time::timeout(timeout, self.find_by_id_contexted(id, &never)).await {
            Ok(found) => found,
            Err(_) => Err(SwitchError::SwitchNotFound(id.clone())),
        }
    }

    /// Number of lookups still waiting for their plan
    pub fn pending_findings(&self) -> usize {
        self.state.lock().findings.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every registered switch
    pub fn cancel_all(&self) {
        let switches: Vec<Arc<Switch>> = self.state.lock().switches.values().cloned().collect();
        for switch in switches {
            switch.cancel();
        }
    }
}

struct FindingGuard<'a> {
    manager: &'a Manager,
    seq: u64,
}

impl Drop for FindingGuard<'_> {
    fn drop(&mut self) {
        self.manager
            .state
            .lock()
            .findings
            .retain(|f| f.seq != self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use crate::testutil::driver_context;

    fn switch(id: &PlanId) -> Arc<Switch> {
        Switch::new(
            Plan::new(id.clone(), vec![]),
            driver_context(),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_find_before_add() {
        let manager = Arc::new(Manager::new());
        let id = PlanId::new();

        let finder = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                manager
                    .find_by_id_contexted(&id, &CancellationToken::new())
                    .await
            })
        };
        while manager.pending_findings() == 0 {
            tokio::task::yield_now().await;
        }

        let sw = switch(&id);
        manager.add(sw.clone()).unwrap();
        let found = finder.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &sw));
        assert_eq!(manager.pending_findings(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_find_leaves_no_finding() {
        let manager = Arc::new(Manager::new());
        let cancel = CancellationToken::new();
        let finder = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.find_by_id_contexted(&PlanId::new(), &cancel).await })
        };
        while manager.pending_findings() == 0 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        assert!(matches!(
            finder.await.unwrap(),
            Err(SwitchError::Cancelled)
        ));
        assert_eq!(manager.pending_findings(), 0);
    }

    #[tokio::test]
    async fn test_find_timeout() {
        let manager = Manager::new();
        let id = PlanId::new();
        let err = manager
            .find_by_id_timeout(&id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchError::SwitchNotFound(_)));
        assert_eq!(manager.pending_findings(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let manager = Manager::new();
        let id = PlanId::new();
        let sw = switch(&id);
        manager.add(sw.clone()).unwrap();

        manager.remove(&sw);
        manager.remove(&sw);
        assert!(manager.find_by_id(&id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_remove_ignores_other_instance() {
        let manager = Manager::new();
        let id = PlanId::new();
        let registered = switch(&id);
        let stale = switch(&id);
        manager.add(registered.clone()).unwrap();

        manager.remove(&stale);
        assert!(manager.find_by_id(&id).is_some());
    }

    #[test]
    fn test_add_duplicate_plan() {
        let manager = Manager::new();
        let id = PlanId::new();
        manager.add(switch(&id)).unwrap();
        assert!(matches!(
            manager.add(switch(&id)),
            Err(SwitchError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_cancel_all() {
        let manager = Manager::new();
        let a = switch(&PlanId::new());
        let b = switch(&PlanId::new());
        manager.add(a.clone()).unwrap();
        manager.add(b.clone()).unwrap();
        manager.cancel_all();
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
