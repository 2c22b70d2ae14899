//! In-process run repository.

use dashmap::DashMap;
use jobflow_types::error::RepositoryError;
use jobflow_types::run::{StepLog, WorkflowRun};
use uuid::Uuid;

use super::run::RunRepository;

/// `RunRepository` backed by concurrent maps. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryRunRepository {
    runs: DashMap<Uuid, WorkflowRun>,
    logs: DashMap<Uuid, Vec<StepLog>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        if self.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} exists", run.id)));
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        match self.runs.get_mut(&run.id) {
            Some(mut stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| workflow_name.is_none_or(|name| r.workflow_name == name))
            .map(|r| r.clone())
            .collect();
        // UUIDv7 ids sort by creation time.
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.clone())
            .collect();
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runs)
    }

    async fn append_step_log(&self, log: &StepLog) -> Result<(), RepositoryError> {
        self.logs.entry(log.run_id).or_default().push(log.clone());
        Ok(())
    }

    async fn list_step_logs(&self, run_id: &Uuid) -> Result<Vec<StepLog>, RepositoryError> {
        Ok(self.logs.get(run_id).map(|l| l.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobflow_types::run::{RunStatus, StepLogStatus};
    use jobflow_types::run_data::RunData;

    fn run(workflow: &str) -> WorkflowRun {
        WorkflowRun::new(workflow, "1.0.0", "start", RunData::new(), None)
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let repo = InMemoryRunRepository::new();
        let r = run("a");
        repo.create_run(&r).await.unwrap();
        assert!(matches!(
            repo.create_run(&r).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn save_requires_existing_run() {
        let repo = InMemoryRunRepository::new();
        let mut r = run("a");
        assert!(matches!(repo.save_run(&r).await, Err(RepositoryError::NotFound)));

        repo.create_run(&r).await.unwrap();
        r.status = RunStatus::Succeeded;
        repo.save_run(&r).await.unwrap();
        let stored = repo.get_run(&r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let repo = InMemoryRunRepository::new();
        let first = run("a");
        let second = run("b");
        let third = run("a");
        for r in [&first, &second, &third] {
            repo.create_run(r).await.unwrap();
        }

        let all = repo.list_runs(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, third.id);

        let only_a = repo.list_runs(Some("a"), 1).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].id, third.id);
    }

    #[tokio::test]
    async fn active_runs_exclude_terminal() {
        let repo = InMemoryRunRepository::new();
        let live = run("a");
        let mut done = run("a");
        done.status = RunStatus::Failed;
        repo.create_run(&live).await.unwrap();
        repo.create_run(&done).await.unwrap();

        let active = repo.list_active_runs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);
    }

    #[tokio::test]
    async fn step_logs_keep_order() {
        let repo = InMemoryRunRepository::new();
        let run_id = Uuid::now_v7();
        for (i, status) in [StepLogStatus::Waiting, StepLogStatus::Advanced].into_iter().enumerate() {
            repo.append_step_log(&StepLog {
                id: Uuid::now_v7(),
                run_id,
                step: "poll".into(),
                sequence: 1,
                attempt: i as u32,
                status,
                detail: None,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        let logs = repo.list_step_logs(&run_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].status, StepLogStatus::Advanced);
        assert!(repo.list_step_logs(&Uuid::now_v7()).await.unwrap().is_empty());
    }
}
