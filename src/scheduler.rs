//! Wave scheduler (§4.2).
//!
//! Generalises the donor's `dag/builder.rs` + `dag/scheduler.rs` pair one
//! level down, from Phase nodes to Task nodes. `parallel_group` is a strict
//! ordering layered on top of the dependency graph: every task in group N
//! completes before any task in group N+1 is considered, so groups are
//! partitioned before the Kahn sweep runs, not after.

use std::collections::{HashMap, HashSet};

use forge_common::Task;

use crate::errors::SchedulerError;

/// Index into the task list, stable for the lifetime of one `TaskGraph`.
pub type TaskIndex = usize;

/// A validated, cycle-free dependency graph over a task set.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index_by_id: HashMap<String, TaskIndex>,
    forward_edges: Vec<Vec<TaskIndex>>,
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    /// Build a graph from a task set, validating that every dependency
    /// resolves within the set and that no cycle exists.
    pub fn build(tasks: Vec<Task>) -> Result<Self, SchedulerError> {
        let mut index_by_id = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            index_by_id.insert(task.id.clone(), i);
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];

        for (to_idx, task) in tasks.iter().enumerate() {
            for dep in &task.dependencies {
                let from_idx = *index_by_id
                    .get(dep)
                    .ok_or_else(|| SchedulerError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = Self {
            tasks,
            index_by_id,
            forward_edges,
            reverse_edges,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn dependencies_satisfied(&self, index: TaskIndex, completed: &HashSet<TaskIndex>) -> bool {
        self.reverse_edges[index].iter().all(|d| completed.contains(d))
    }

    fn validate_no_cycles(&self) -> Result<(), SchedulerError> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(|d| d.len()).collect();
        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.forward_edges[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.tasks.len() {
            let path = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.tasks[i].id.clone())
                .collect();
            return Err(SchedulerError::CircularDependency { path });
        }
        Ok(())
    }

    /// Partitions the whole task set by ascending `parallel_group` first,
    /// then runs an independent Kahn sweep within each group's own task set.
    /// A group never starts until every earlier group has fully completed,
    /// so `parallel_group` is a strict ordering on top of the dependency
    /// layering, not merely a sub-partition of one global sweep. Each
    /// Kahn layer inside a group becomes its own wave; `UnschedulableTasks`
    /// fires when a group still has unresolved tasks but none of them are
    /// ready, which happens when a task depends on work in a later group.
    pub fn compute_waves(&self) -> Result<Vec<Vec<Vec<&Task>>>, SchedulerError> {
        let mut waves = Vec::new();
        let mut completed: HashSet<TaskIndex> = HashSet::new();

        let mut groups: Vec<u32> = self.tasks.iter().map(|t| t.parallel_group).collect();
        groups.sort_unstable();
        groups.dedup();

        for group in groups {
            let group_indices: Vec<TaskIndex> = (0..self.tasks.len())
                .filter(|&i| self.tasks[i].parallel_group == group)
                .collect();

            while group_indices.iter().any(|i| !completed.contains(i)) {
                let ready: Vec<TaskIndex> = group_indices
                    .iter()
                    .copied()
                    .filter(|i| !completed.contains(i) && self.dependencies_satisfied(*i, &completed))
                    .collect();

                if ready.is_empty() {
                    let remaining = group_indices
                        .iter()
                        .filter(|i| !completed.contains(i))
                        .map(|&i| self.tasks[i].id.clone())
                        .collect();
                    return Err(SchedulerError::UnschedulableTasks { remaining });
                }

                let wave: Vec<&Task> = ready.iter().map(|&i| &self.tasks[i]).collect();
                waves.push(vec![wave]);
                completed.extend(ready);
            }
        }

        Ok(waves)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Task> {
        self.index_by_id.get(id).map(|&i| &self.tasks[i])
    }
}
