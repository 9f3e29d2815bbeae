//! Cierre de jobs del lado master: reintentos de tareas, y al final commit
//! o abort con los callbacks del engine en el orden en que los dispara.

use chrono::Utc;
use tracing::{info, warn};

use common::{ConnectorError, JobStatus, Task, TaskOutputRecord};

use crate::state::{lock, AppState, JobRun};
use crate::MAX_TASK_ATTEMPTS;

/// Corre trabajo del protocolo (I/O de archivos y warehouse) fuera del
/// runtime async.
pub async fn run_blocking<T, F>(f: F) -> common::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> common::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConnectorError::illegal_state(format!("blocking task panicked: {e}")))?
}

/// Acepta el artefacto de un intento. Si el job ya falló el artefacto se
/// descarta en lugar de commitearse.
pub async fn accept_output(state: &AppState, task: Task, record: TaskOutputRecord) {
    let job_id = task.job_id.clone();
    let Some(run) = state.run(&job_id) else {
        warn!("job {} ya cerrado, se ignora la salida de la tarea {}", job_id, task.id);
        return;
    };

    let job_failed = lock(&state.jobs)
        .get(&job_id)
        .is_some_and(|j| j.status == JobStatus::Failed);
    if job_failed {
        abort_attempt(&run, &task.db_table, &task.attempt_id()).await;
        resolve_tasks(state, &run, &job_id, 1).await;
        return;
    }

    let r = run.clone();
    let committed = run_blocking(move || r.trigger.on_task_commit(&r.coordinator, &record)).await;
    match committed {
        Ok(()) => {
            if let Some(job) = lock(&state.jobs).get_mut(&job_id) {
                job.completed_tasks += 1;
            }
            resolve_tasks(state, &run, &job_id, 1).await;
        }
        Err(e) => {
            // un artefacto perdido se arregla con otro intento; el estado del job no
            let fatal = matches!(
                e,
                ConnectorError::MissingJobState { .. } | ConnectorError::Configuration { .. }
            );
            retry_or_fail(state, task, e.to_string(), fatal).await;
        }
    }
}

/// Libera lo que dejó el intento y lo reencola con `attempt + 1`, o marca el
/// job como fallido si es fatal o se acabaron los intentos.
pub async fn retry_or_fail(state: &AppState, mut task: Task, error: String, fatal: bool) {
    let job_id = task.job_id.clone();
    let Some(run) = state.run(&job_id) else {
        warn!("job {} ya cerrado, no se reintenta la tarea {}: {}", job_id, task.id, error);
        return;
    };
    abort_attempt(&run, &task.db_table, &task.attempt_id()).await;

    let can_retry = !fatal && task.attempt + 1 < MAX_TASK_ATTEMPTS;
    let resolved = {
        let mut jobs = lock(&state.jobs);
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };
        match job.status {
            // otra tarea ya tiró el job abajo
            JobStatus::Failed => 1,
            JobStatus::Accepted | JobStatus::Running if can_retry => {
                task.attempt += 1;
                job.retries += 1;
                info!(
                    "reencolando tarea {} del job {} (attempt={}): {}",
                    task.id, job_id, task.attempt, error
                );
                lock(&state.tasks_queue).push_back(task);
                0
            }
            JobStatus::Accepted | JobStatus::Running => {
                warn!(
                    "tarea {} del job {} falló sin reintento (attempt={}, fatal={}): {}",
                    task.id, job_id, task.attempt, fatal, error
                );
                job.failed_tasks += 1;
                job.status = JobStatus::Failed;
                job.error = Some(error);
                // lo que quedaba en cola ya no se corre
                let mut queue = lock(&state.tasks_queue);
                let before = queue.len();
                queue.retain(|t| t.job_id != job_id);
                1 + before - queue.len()
            }
            status => {
                warn!(
                    "tarea {} del job {} reportada con el job en {:?}, se ignora: {}",
                    task.id, job_id, status, error
                );
                return;
            }
        }
    };

    if resolved > 0 {
        resolve_tasks(state, &run, &job_id, resolved).await;
    }
}

async fn resolve_tasks(state: &AppState, run: &JobRun, job_id: &str, n: usize) {
    if run.resolve_tasks(n) == 0 {
        settle_job(state, job_id).await;
    }
}

/// Libera los artefactos de un intento. Nunca falla.
pub async fn abort_attempt(run: &JobRun, db_table: &str, attempt_id: &str) {
    let r = run.clone();
    let (table, attempt) = (db_table.to_string(), attempt_id.to_string());
    let released =
        run_blocking(move || r.trigger.on_task_abort(&r.coordinator, &table, &attempt)).await;
    if let Err(e) = released {
        warn!("no se pudo abortar el intento {} de {}: {}", attempt_id, db_table, e);
    }
}

/// Si el job no tiene tareas abiertas lo cierra: commit si todas salieron
/// bien, abort si falló. Sólo el primero que saca el `JobRun` lo cierra.
pub async fn settle_job(state: &AppState, job_id: &str) {
    let run = {
        let mut runs = lock(&state.runs);
        match runs.get(job_id) {
            Some(run) if run.open_tasks() == 0 => runs.remove(job_id),
            _ => None,
        }
    };
    let Some(run) = run else {
        return;
    };

    let failed = {
        let mut jobs = lock(&state.jobs);
        match jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Failed => true,
            Some(job) => {
                job.status = JobStatus::Committing;
                false
            }
            None => true,
        }
    };

    if failed {
        let r = run.clone();
        if let Err(e) = run_blocking(move || {
            abort_run(&r);
            Ok(())
        })
        .await
        {
            warn!("abort del job {} incompleto: {}", job_id, e);
        }
        if let Some(job) = lock(&state.jobs).get_mut(job_id) {
            job.finished_at = Some(Utc::now());
            warn!("job {} abortado: {}", job_id, job.error.as_deref().unwrap_or("sin detalle"));
        }
        return;
    }

    let r = run.clone();
    let result = run_blocking(move || commit_run(&r)).await;

    let mut jobs = lock(&state.jobs);
    let Some(job) = jobs.get_mut(job_id) else {
        return;
    };
    job.finished_at = Some(Utc::now());
    match result {
        Ok(rows) => {
            info!("job {} commiteado: {} filas en {}", job_id, rows, job.table);
            job.status = JobStatus::Succeeded;
            job.rows_committed = Some(rows);
        }
        Err(e) => {
            warn!("commit del job {} falló: {}", job_id, e);
            job.status = JobStatus::Failed;
            job.error = Some(e.to_string());
        }
    }
}

/// Secuencia de éxito: callback de commit del committer, hook de table-commit
/// y post-exec. Cada trigger ignora los que no son suyos.
fn commit_run(run: &JobRun) -> common::Result<u64> {
    let tables = [run.db_table.clone()];
    let coord = &run.coordinator;

    let result = run
        .trigger
        .on_job_commit(coord, &tables)
        .map(|outcomes| outcomes.iter().map(|(_, o)| o.rows).sum::<u64>())
        .and_then(|rows| {
            let hooked = run.trigger.on_table_commit_hook(coord, &run.db_table, run.overwrite)?;
            Ok(rows + hooked.map_or(0, |o| o.rows))
        });

    if result.is_err() {
        abort_tables(run);
    }
    run.trigger.on_query_complete(coord);
    result
}

/// Secuencia de fallo: abort del committer, hook de fallo y post-exec.
fn abort_run(run: &JobRun) {
    abort_tables(run);
    run.trigger.on_query_complete(&run.coordinator);
}

fn abort_tables(run: &JobRun) {
    let tables = [run.db_table.clone()];
    run.trigger.on_job_abort(&run.coordinator, &tables);
    run.trigger.on_failure_hook(&run.coordinator, &tables);
}
