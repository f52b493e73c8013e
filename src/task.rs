//! Supervision of the long-lived tracer tasks.
//!
//! Every registered task runs on its own named thread. [`TaskManager::run`]
//! waits for all of them; a failing or panicking task never stops its
//! siblings, its error is collected and reported once everything returned.

use std::fmt;
use std::thread;

use anyhow::{anyhow, Result};

type TaskFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

pub struct Task {
    name: String,
    body: TaskFn,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Vec<Task>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, name: &str, body: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.tasks.push(Task {
            name: name.to_string(),
            body: Box::new(body),
        });
    }

    pub fn list(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    /// Run every task concurrently and wait for all of them.
    ///
    /// Returns one error naming each task that failed or panicked.
    pub fn run(self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.tasks.len());
        let mut failures = Vec::new();

        for task in self.tasks {
            let Task { name, body } = task;
            tracing::info!("Starting task {name}");
            match thread::Builder::new().name(name.clone()).spawn(body) {
                Ok(handle) => handles.push((name, handle)),
                Err(e) => failures.push(format!("{name}: failed to spawn: {e}")),
            }
        }

        for (name, handle) in handles {
            match handle.join() {
                Ok(Ok(())) => tracing::info!("Task {name} finished"),
                Ok(Err(e)) => {
                    tracing::error!("Task {name} failed: {e:#}");
                    failures.push(format!("{name}: {e:#}"));
                }
                Err(_) => {
                    tracing::error!("Task {name} panicked");
                    failures.push(format!("{name}: panicked"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} task(s) failed: {}",
                failures.len(),
                failures.join("; ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_registry() {
        let mut tm = TaskManager::new();
        tm.add("events", || Ok(()));
        tm.add("files", || Ok(()));
        assert_eq!(tm.list(), vec!["events", "files"]);
        assert_eq!(format!("{:?}", tm.tasks[0]), "Task { name: \"events\" }");
    }

    #[test]
    fn test_run_all_ok() {
        let mut tm = TaskManager::new();
        for name in ["a", "b", "c"] {
            tm.add(name, || Ok(()));
        }
        tm.run().unwrap();
        TaskManager::new().run().unwrap();
    }

    #[test]
    fn test_errors_are_aggregated_and_siblings_keep_running() {
        let shutdown = Shutdown::new();
        let sibling_done = Arc::new(AtomicBool::new(false));

        let mut tm = TaskManager::new();
        tm.add("broken", || Err(anyhow!("map iteration failed")));
        tm.add("panicky", || panic!("boom"));
        {
            let shutdown = shutdown.clone();
            let done = sibling_done.clone();
            tm.add("consumer", move || {
                shutdown.wait_timeout(Duration::from_secs(10));
                done.store(true, Ordering::SeqCst);
                Ok(())
            });
        }
        let canceller = shutdown.clone();
        tm.add("canceller", move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
            Ok(())
        });

        let err = tm.run().unwrap_err().to_string();
        assert!(sibling_done.load(Ordering::SeqCst));
        assert!(err.starts_with("2 task(s) failed"));
        assert!(err.contains("broken: map iteration failed"));
        assert!(err.contains("panicky: panicked"));
        assert!(!err.contains("consumer"));
    }
}
