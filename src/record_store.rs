//! Durable Plan/Task rows via Postgres, written once at admission and
//! updated once on completion.
//!
//! Grounded on the reference implementation's `record.go` repository
//! (a gorm-backed plan/task table pair with create + batch-update methods)
//! — re-expressed with `sqlx`'s compile-time-checked query macros, which is
//! the pack's dominant durable-store idiom (see DESIGN.md's dependency
//! ledger for the repos this is grounded against).

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::errors::RecordStoreError;
use crate::model::{PlanRecord, PlanStatus, TaskRecord, TaskStatus};

pub struct RecordStore {
    pool: PgPool,
}

impl RecordStore {
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self, RecordStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await
            .map_err(|e| RecordStoreError::Transport(e.to_string()))?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts the plan row and every task row in a single transaction,
    /// at admission time once placement has succeeded (§4.1 step 4).
    pub async fn create_plan(
        &self,
        plan: &PlanRecord,
        tasks: &[TaskRecord],
    ) -> Result<(), RecordStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RecordStoreError::Transport(e.to_string()))?;

        sqlx::query(
            "INSERT INTO plans (plan_id, user_id, name, status, create_time) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(plan.plan_id)
        .bind(plan.user_id)
        .bind(&plan.name)
        .bind(status_label(plan.status))
        .bind(plan.create_time)
        .execute(&mut *tx)
        .await
        .map_err(|e| RecordStoreError::Transport(e.to_string()))?;

        for task in tasks {
            sqlx::query(
                "INSERT INTO tasks (task_id, plan_id, url, status, stat_ext, create_time) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(task.task_id)
            .bind(task.plan_id)
            .bind(&task.url)
            .bind(task_status_label(task.status))
            .bind(&task.stat_ext)
            .bind(task.create_time)
            .execute(&mut *tx)
            .await
            .map_err(|e| RecordStoreError::Transport(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RecordStoreError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Flips a plan's status, called on stop/complete/fail transitions.
    pub async fn update_plan_status(
        &self,
        plan_id: i64,
        status: PlanStatus,
    ) -> Result<(), RecordStoreError> {
        let result = sqlx::query("UPDATE plans SET status = $1 WHERE plan_id = $2")
            .bind(status_label(status))
            .bind(plan_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RecordStoreError::Transport(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(RecordStoreError::PlanNotFound(plan_id));
        }
        Ok(())
    }

    /// Writes the integrator's final per-task summary (`stat_ext`) once the
    /// task completes, per §6's Analytics persistence note.
    pub async fn finalize_task(
        &self,
        task_id: i64,
        stat_ext: serde_json::Value,
    ) -> Result<(), RecordStoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = $1, stat_ext = $2 WHERE task_id = $3",
        )
        .bind(task_status_label(TaskStatus::Done))
        .bind(stat_ext)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| RecordStoreError::Transport(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RecordStoreError::NoRowsAffected);
        }
        Ok(())
    }

    pub async fn get_plan(&self, plan_id: i64) -> Result<PlanRecord, RecordStoreError> {
        let row: (i64, i64, String, String, i64) = sqlx::query_as(
            "SELECT plan_id, user_id, name, status, create_time FROM plans WHERE plan_id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RecordStoreError::Transport(e.to_string()))?
        .ok_or(RecordStoreError::PlanNotFound(plan_id))?;

        Ok(PlanRecord {
            plan_id: row.0,
            user_id: row.1,
            name: row.2,
            status: parse_plan_status(&row.3),
            create_time: row.4,
        })
    }
}

fn status_label(status: PlanStatus) -> &'static str {
    match status {
        PlanStatus::Doing => "doing",
        PlanStatus::Done => "done",
        PlanStatus::Stop => "stop",
    }
}

fn parse_plan_status(label: &str) -> PlanStatus {
    match label {
        "done" => PlanStatus::Done,
        "stop" => PlanStatus::Stop,
        _ => PlanStatus::Doing,
    }
}

fn task_status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Doing => "doing",
        TaskStatus::Done => "done",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_round_trip() {
        for status in [PlanStatus::Doing, PlanStatus::Done, PlanStatus::Stop] {
            assert_eq!(parse_plan_status(status_label(status)), status);
        }
    }
}
