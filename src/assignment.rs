//! Worker-selection heuristic.

use crate::models::Worker;

/// Pick the least-loaded worker advertising `action_id`.
///
/// Ties break on id order so selection is deterministic for a fixed load
/// snapshot. `None` is an expected steady state, not an error: worker pools
/// fluctuate and the requeue sweep retries later.
pub fn select_worker<'a>(workers: &'a [Worker], action_id: &str) -> Option<&'a Worker> {
    let mut eligible: Vec<&Worker> = workers
        .iter()
        .filter(|worker| worker.actions.contains(action_id))
        .collect();
    eligible.sort_by_key(|worker| worker.id);
    eligible
        .into_iter()
        .min_by_key(|worker| worker.assigned_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn worker(action: &str, assigned_count: usize) -> Worker {
        Worker {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            dispatcher_id: Uuid::new_v4(),
            actions: [action.to_string()].into(),
            assigned_count,
        }
    }

    #[test]
    fn picks_least_loaded_eligible_worker() {
        let a = worker("echo", 3);
        let b = worker("echo", 1);
        let c = worker("echo", 1);
        let workers = vec![a.clone(), b.clone(), c.clone()];

        let picked = select_worker(&workers, "echo").expect("worker");
        assert_ne!(picked.id, a.id, "most loaded worker must never win");
        assert_eq!(picked.assigned_count, 1);
    }

    #[test]
    fn selection_is_deterministic_for_a_fixed_snapshot() {
        let workers = vec![worker("echo", 2), worker("echo", 2), worker("echo", 2)];
        let first = select_worker(&workers, "echo").expect("worker").id;
        for _ in 0..10 {
            assert_eq!(select_worker(&workers, "echo").expect("worker").id, first);
        }
        // Ties break on the smallest id.
        let min_id = workers.iter().map(|w| w.id).min().expect("min id");
        assert_eq!(first, min_id);
    }

    #[test]
    fn ignores_workers_without_the_action() {
        let workers = vec![worker("transcode", 0)];
        assert!(select_worker(&workers, "echo").is_none());
    }

    #[test]
    fn empty_pool_selects_nothing() {
        assert!(select_worker(&[], "echo").is_none());
    }
}
