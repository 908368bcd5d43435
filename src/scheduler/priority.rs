//! Effective priority and aging.
//!
//! Lower is higher priority. A task's base priority is discounted by how
//! many ticks it has waited, whether a plan exists for it, and how deep its
//! dependency chain is; ties break by task id.

use crate::kanban::Task;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PriorityWeights {
    /// Discount per tick spent ready-but-unspawned.
    pub age_factor: i32,
    /// Flat discount for tasks with a plan file.
    pub plan_bonus: i32,
    /// Discount per level of dependency depth.
    pub dep_bonus: i32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            age_factor: 1,
            plan_bonus: 10,
            dep_bonus: 2,
        }
    }
}

pub fn effective_priority(
    task: &Task,
    iters_waiting: u32,
    dep_depth: u32,
    weights: &PriorityWeights,
) -> i32 {
    let mut priority = task.priority;
    priority -= weights.age_factor * iters_waiting as i32;
    if task.has_plan {
        priority -= weights.plan_bonus;
    }
    priority -= weights.dep_bonus * dep_depth as i32;
    priority
}

/// Order candidates best-first by effective priority, ties by id.
pub fn rank<'a>(
    tasks: &'a [Task],
    aging: &AgingTracker,
    depths: &HashMap<String, u32>,
    weights: &PriorityWeights,
) -> Vec<&'a Task> {
    let mut ranked: Vec<&Task> = tasks.iter().collect();
    ranked.sort_by(|a, b| {
        let pa = effective_priority(a, aging.get(&a.id), depths.get(&a.id).copied().unwrap_or(0), weights);
        let pb = effective_priority(b, aging.get(&b.id), depths.get(&b.id).copied().unwrap_or(0), weights);
        pa.cmp(&pb).then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// Ticks each ready-but-unspawned task has waited. Entries reset when a
/// task is spawned or stops being ready.
#[derive(Debug, Default)]
pub struct AgingTracker {
    iters_waiting: HashMap<String, u32>,
}

impl AgingTracker {
    /// One tick: bump every currently ready id, drop every id that is not.
    pub fn observe(&mut self, ready_ids: &[String]) {
        self.iters_waiting
            .retain(|id, _| ready_ids.iter().any(|r| r == id));
        for id in ready_ids {
            *self.iters_waiting.entry(id.clone()).or_insert(0) += 1;
        }
    }

    /// A task was spawned; its wait is over.
    pub fn reset(&mut self, id: &str) {
        self.iters_waiting.remove(id);
    }

    pub fn get(&self, id: &str) -> u32 {
        self.iters_waiting.get(id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kanban::TaskStatus;

    fn task(id: &str, priority: i32, has_plan: bool) -> Task {
        Task {
            id: id.to_string(),
            status: TaskStatus::Pending,
            brief: String::new(),
            priority,
            deps: Vec::new(),
            has_plan,
        }
    }

    #[test]
    fn test_effective_priority_discounts() {
        let weights = PriorityWeights::default();
        let plain = task("AB-1", 50, false);
        assert_eq!(effective_priority(&plain, 0, 0, &weights), 50);
        assert_eq!(effective_priority(&plain, 5, 0, &weights), 45);
        assert_eq!(effective_priority(&plain, 0, 3, &weights), 44);

        let planned = task("AB-2", 50, true);
        assert_eq!(effective_priority(&planned, 0, 0, &weights), 40);
    }

    #[test]
    fn test_rank_orders_and_breaks_ties_by_id() {
        let weights = PriorityWeights::default();
        let tasks = vec![task("AB-2", 50, false), task("AB-1", 50, false), task("AB-3", 30, false)];
        let aging = AgingTracker::default();
        let ranked = rank(&tasks, &aging, &HashMap::new(), &weights);
        let ids: Vec<_> = ranked.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["AB-3", "AB-1", "AB-2"]);
    }

    #[test]
    fn test_aging_promotes_waiting_task() {
        let weights = PriorityWeights::default();
        let tasks = vec![task("AB-1", 50, false), task("AB-2", 45, false)];
        let mut aging = AgingTracker::default();

        // AB-1 waits ten ticks while AB-2 arrives fresh
        for _ in 0..10 {
            aging.observe(&["AB-1".to_string()]);
        }
        aging.observe(&["AB-1".to_string(), "AB-2".to_string()]);

        let ranked = rank(&tasks, &aging, &HashMap::new(), &weights);
        assert_eq!(ranked[0].id, "AB-1");
    }

    #[test]
    fn test_aging_resets_on_spawn_and_unready() {
        let mut aging = AgingTracker::default();
        aging.observe(&["AB-1".to_string(), "AB-2".to_string()]);
        aging.observe(&["AB-1".to_string(), "AB-2".to_string()]);
        assert_eq!(aging.get("AB-1"), 2);

        aging.reset("AB-1");
        assert_eq!(aging.get("AB-1"), 0);

        // AB-2 no longer ready: entry dropped
        aging.observe(&["AB-1".to_string()]);
        assert_eq!(aging.get("AB-2"), 0);
        assert_eq!(aging.get("AB-1"), 1);
    }
}
