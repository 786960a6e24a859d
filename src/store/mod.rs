use crate::models::{Task, TaskStatus, Verdict};
use crate::{Result, WopaError};
use std::collections::HashMap;
use std::sync::Mutex;

/// Concurrent per-tier task map with compare-and-set status transitions.
///
/// Uses a synchronous mutex: every critical section is a map operation,
/// and the cancellation guard must be able to mark tasks from `Drop`.
/// Memory is bounded by a soft cap; crossing it evicts the oldest
/// terminal tasks (active tasks are never evicted).
pub struct TaskStore {
    tasks: Mutex<HashMap<String, Task>>,
    soft_cap: usize,
}

impl TaskStore {
    pub fn new(soft_cap: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            soft_cap,
        }
    }

    /// Insert a new task. Fails if the id is already present.
    pub fn create(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("task store poisoned");
        if tasks.contains_key(&task.task_id) {
            return Err(WopaError::TaskExists(task.task_id));
        }
        tasks.insert(task.task_id.clone(), task);
        Self::evict_over_cap(&mut tasks, self.soft_cap);
        Ok(())
    }

    /// Atomic compare-and-set on the status. The transition must match
    /// the expected `from` state and be a legal DAG edge.
    pub fn transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("task store poisoned");
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| WopaError::TaskNotFound(task_id.to_string()))?;
        if task.status != from || !from.can_transition_to(to) {
            return Err(WopaError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        task.status = to;
        task.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Store a verdict and complete the task. Only legal from
    /// `in_progress`.
    pub fn set_result(&self, task_id: &str, result: Verdict) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("task store poisoned");
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| WopaError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::InProgress {
            return Err(WopaError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.as_str().to_string(),
                to: TaskStatus::Completed.as_str().to_string(),
            });
        }
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.error = None;
        task.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Record an error and terminate the task. Legal from any
    /// non-terminal state.
    pub fn set_error(&self, task_id: &str, error: String) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("task store poisoned");
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| WopaError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(WopaError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.as_str().to_string(),
                to: TaskStatus::Error.as_str().to_string(),
            });
        }
        task.status = TaskStatus::Error;
        task.error = Some(error);
        task.result = None;
        task.updated_at = chrono::Utc::now();
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        let tasks = self.tasks.lock().expect("task store poisoned");
        tasks.get(task_id).cloned()
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().expect("task store poisoned");
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_over_cap(tasks: &mut HashMap<String, Task>, soft_cap: usize) {
        while tasks.len() > soft_cap {
            let oldest_terminal = tasks
                .values()
                .filter(|t| t.status.is_terminal())
                .min_by_key(|t| t.updated_at)
                .map(|t| t.task_id.clone());
            match oldest_terminal {
                Some(id) => {
                    tasks.remove(&id);
                }
                // Only active tasks remain; the cap is soft.
                None => break,
            }
        }
    }
}
