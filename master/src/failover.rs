use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use tokio::time::sleep;
use tracing::warn;

use common::Task;

use crate::driver;
use crate::state::{lock, AppState};
use crate::{FAILOVER_SWEEP_INTERVAL_SECS, WORKER_HEARTBEAT_TIMEOUT_SECS};

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat)
/// - aborta sus intentos en vuelo y reencola las tareas
pub async fn run_failover_loop(state: AppState) {
    loop {
        sleep(Duration::from_secs(FAILOVER_SWEEP_INTERVAL_SECS)).await;
        sweep_once(&state, SystemTime::now()).await;
    }
}

/// Una pasada de chequeo:
/// 1. marca workers muertos
/// 2. saca de in_flight las tareas de esos workers
/// 3. cada intento perdido se aborta antes de reintentar la tarea, así sus
///    artefactos nunca entran en el commit del job
pub async fn sweep_once(state: &AppState, now: SystemTime) {
    let timeout = Duration::from_secs(WORKER_HEARTBEAT_TIMEOUT_SECS);
    let lost = take_lost_tasks(state, now, timeout);

    for (task, worker_id) in lost {
        let error = format!("worker {worker_id} lost (no heartbeat)");
        driver::retry_or_fail(state, task, error, false).await;
    }
}

fn take_lost_tasks(state: &AppState, now: SystemTime, timeout: Duration) -> Vec<(Task, String)> {
    // 1) Detectar qué workers están muertos
    let mut dead: HashSet<String> = HashSet::new();
    {
        let mut workers = lock(&state.workers);
        for (worker_id, meta) in workers.iter_mut().filter(|(_, m)| !m.dead) {
            // last_heartbeat en el futuro: reloj movido, se ignora
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                continue;
            };
            if elapsed > timeout {
                meta.dead = true;
                dead.insert(worker_id.clone());
                warn!(
                    "marcando worker {} como DEAD (sin heartbeat hace {:?})",
                    worker_id, elapsed
                );
            }
        }
    }

    if dead.is_empty() {
        return Vec::new();
    }

    // 2) Sacar de in_flight las tareas de esos workers
    let mut in_flight = lock(&state.in_flight);
    let lost_ids: Vec<String> = in_flight
        .iter()
        .filter(|(_, it)| dead.contains(&it.worker_id))
        .map(|(id, _)| id.clone())
        .collect();

    lost_ids
        .into_iter()
        .filter_map(|id| in_flight.remove(&id))
        .map(|it| (it.task, it.worker_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InFlight, JobRun, WorkerMeta};
    use common::{
        setup::{prepare_output_table, CreateTable},
        writer::write_task_output,
        FieldSchema, FieldType, JobConfig, JobInfo, JobStatus, LocalWarehouse, TableId,
        TableSchema, Value, WriteStrategy,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn worker_muerto_aborta_su_intento_y_reencola() {
        let (work, staging, root) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        let defaults = JobConfig::builder("")
            .work_dir_parent(work.path())
            .staging_root(staging.path())
            .write_strategy(WriteStrategy::Staged);
        let state = AppState::new(Arc::new(LocalWarehouse::new(root.path())), defaults.clone());

        let config = Arc::new(defaults.query_id("job-1").build());
        let table_id = TableId::new("p", "d", "t");
        let schema = TableSchema::new(vec![FieldSchema::new("id", FieldType::Integer)]);
        let desc = prepare_output_table(
            &config,
            state.warehouse.as_ref(),
            "d.t",
            &table_id,
            false,
            Some(CreateTable { schema: &schema, partitioning: None }),
        )
        .unwrap();

        let task = Task {
            id: "t0".into(),
            job_id: "job-1".into(),
            db_table: "d.t".into(),
            partition: 0,
            attempt: 0,
            input_path: String::new(),
        };
        // el worker llegó a escribir su archivo antes de desaparecer
        let out = write_task_output(
            &desc,
            state.warehouse.as_ref(),
            &task.attempt_id(),
            0,
            10,
            vec![Ok(vec![Value::Int64(1)])],
        )
        .unwrap();
        assert!(out.artifact.local_path().exists());

        let long_ago = SystemTime::now() - Duration::from_secs(WORKER_HEARTBEAT_TIMEOUT_SECS * 10);
        lock(&state.workers).insert(
            "w1".into(),
            WorkerMeta {
                hostname: "h".into(),
                last_heartbeat: long_ago,
                dead: false,
                max_concurrency: 1,
                tasks_started: 1,
                tasks_succeeded: 0,
                tasks_failed: 0,
            },
        );
        lock(&state.in_flight).insert(
            task.id.clone(),
            InFlight { task: task.clone(), worker_id: "w1".into(), started_at: long_ago },
        );
        lock(&state.jobs).insert(
            "job-1".into(),
            JobInfo {
                id: "job-1".into(),
                name: "j".into(),
                status: JobStatus::Running,
                table: table_id.to_string(),
                db_table: "d.t".into(),
                engine: config.engine(),
                write_method: config.write_strategy(),
                overwrite: false,
                input_glob: String::new(),
                submitted_at: chrono::Utc::now(),
                started_at: None,
                finished_at: None,
                total_tasks: 1,
                completed_tasks: 0,
                failed_tasks: 0,
                retries: 0,
                rows_committed: None,
                error: None,
            },
        );
        lock(&state.runs).insert(
            "job-1".into(),
            JobRun::new(config.clone(), state.warehouse.clone(), "d.t".into(), false, 1),
        );

        sweep_once(&state, SystemTime::now()).await;

        assert!(lock(&state.workers)["w1"].dead);
        assert!(lock(&state.in_flight).is_empty());
        let queued: Vec<Task> = lock(&state.tasks_queue).iter().cloned().collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempt, 1);
        assert!(!out.artifact.local_path().exists(), "el intento perdido no se abortó");
        assert_eq!(lock(&state.jobs)["job-1"].retries, 1);
    }
}
