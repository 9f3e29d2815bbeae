use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    setup::{prepare_output_table, CreateTable},
    ConnectorError, JobInfo, JobStatus, TableId, TableStatistics, Task, TaskAssignmentRequest,
    TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerRegisterRequest, WorkerRegisterResponse, WriteJobRequest,
};
use glob::glob;
use std::{path::PathBuf, sync::Arc, time::SystemTime};
use tracing::{info, warn};

use crate::driver::{self, run_blocking};
use crate::state::{lock, AppState, InFlight, JobRun, WorkerMeta};

type ApiError = (StatusCode, String);

fn api_error(e: ConnectorError) -> ApiError {
    let status = match e {
        ConnectorError::Configuration { .. } => StatusCode::BAD_REQUEST,
        ConnectorError::MissingJobState { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/tables/:table_id/stats", get(table_stats))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

fn collect_inputs(pattern: &str) -> Result<Vec<PathBuf>, ApiError> {
    let entries = glob(pattern).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("invalid input_glob `{pattern}`: {e}"),
        )
    })?;
    let mut files: Vec<PathBuf> = entries.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    files.sort();
    Ok(files)
}

// Prepara la tabla (setup del output job) y genera una tarea por archivo de input_glob
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<WriteJobRequest>,
) -> Result<Json<JobInfo>, ApiError> {
    let table_id: TableId = req.table.parse().map_err(api_error)?;
    let db_table = req
        .db_table
        .clone()
        .unwrap_or_else(|| format!("{}.{}", table_id.dataset, table_id.table));
    let job_id = uuid::Uuid::new_v4().to_string();

    let mut builder = state.job_defaults.clone().query_id(job_id.clone());
    if let Some(engine) = req.engine {
        builder = builder.engine(engine);
    }
    if let Some(method) = req.write_method {
        builder = builder.write_strategy(method);
    }
    let config = Arc::new(builder.build());

    let inputs = collect_inputs(&req.input_glob)?;

    // el descriptor tiene que existir antes de que corra cualquier tarea
    {
        let (config, warehouse) = (config.clone(), state.warehouse.clone());
        let (db_table, table_id, overwrite) = (db_table.clone(), table_id.clone(), req.overwrite);
        let (schema, partitioning) = (req.create_schema.clone(), req.partitioning.clone());
        run_blocking(move || {
            let create = schema.as_ref().map(|schema| CreateTable {
                schema,
                partitioning: partitioning.as_ref(),
            });
            prepare_output_table(&config, warehouse.as_ref(), &db_table, &table_id, overwrite, create)
        })
        .await
        .map_err(api_error)?;
    }

    let tasks: Vec<Task> = inputs
        .iter()
        .enumerate()
        .map(|(partition, path)| Task {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.clone(),
            db_table: db_table.clone(),
            partition: partition as u32,
            attempt: 0,
            input_path: path.to_string_lossy().to_string(),
        })
        .collect();

    let job_info = JobInfo {
        id: job_id.clone(),
        name: req.name,
        status: JobStatus::Accepted,
        table: table_id.to_string(),
        db_table: db_table.clone(),
        engine: config.engine(),
        write_method: config.write_strategy(),
        overwrite: req.overwrite,
        input_glob: req.input_glob,

        submitted_at: Utc::now(),
        started_at: None,
        finished_at: None,
        total_tasks: tasks.len() as u32,
        completed_tasks: 0,
        failed_tasks: 0,
        retries: 0,
        rows_committed: None,
        error: None,
    };

    info!(
        "job {} aceptado: {} tareas -> {} ({}, {}, overwrite={})",
        job_id,
        tasks.len(),
        table_id,
        config.engine(),
        config.write_strategy(),
        req.overwrite
    );

    lock(&state.jobs).insert(job_id.clone(), job_info);
    lock(&state.runs).insert(
        job_id.clone(),
        JobRun::new(config, state.warehouse.clone(), db_table, req.overwrite, tasks.len()),
    );

    if tasks.is_empty() {
        // sin entrada: commit vacío, la tabla no se toca
        driver::settle_job(&state, &job_id).await;
    } else {
        lock(&state.tasks_queue).extend(tasks);
    }

    let jobs = lock(&state.jobs);
    jobs.get(&job_id)
        .cloned()
        .map(Json)
        .ok_or((StatusCode::INTERNAL_SERVER_ERROR, format!("job {job_id} lost")))
}

// Devuelve info básica de un job
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    let jobs = lock(&state.jobs);

    if let Some(job) = jobs.get(&id) {
        Ok(Json(job.clone()))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// Estadísticas básicas de una tabla del warehouse
async fn table_stats(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<TableStatistics>, ApiError> {
    let id: TableId = table.parse().map_err(api_error)?;
    let warehouse = state.warehouse.clone();
    let stats = run_blocking(move || match warehouse.get_table(&id)? {
        Some(_) => warehouse.list_table_basic_statistics(&id).map(Some),
        None => Ok(None),
    })
    .await
    .map_err(api_error)?;

    stats
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("table {table} not found")))
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    lock(&state.workers).insert(
        worker_id.clone(),
        WorkerMeta {
            hostname: req.hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency: req.max_concurrency,

            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
        },
    );

    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, req.max_concurrency
    );
    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = lock(&state.workers);
    let Some(meta) = workers.get_mut(&req.worker_id) else {
        // id desconocido (p. ej. el master se reinició): el worker se registra de nuevo
        return Err(StatusCode::NOT_FOUND);
    };
    if meta.dead {
        // sus intentos en vuelo ya se abortaron y reencolaron; desde acá
        // vuelve a recibir tareas nuevas
        info!("worker {} vuelve a dar señales, se revive", req.worker_id);
        meta.dead = false;
    }
    meta.last_heartbeat = SystemTime::now();
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

// Asigna la siguiente tarea en cola (si hay)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Json<TaskAssignmentResponse> {
    // 1) Cuántas tareas tiene ya este worker en vuelo
    let active_for_worker = lock(&state.in_flight)
        .values()
        .filter(|entry| entry.worker_id == req.worker_id)
        .count();

    // 2) Capacidad del worker; uno desconocido o muerto no recibe nada
    let max_for_worker = lock(&state.workers)
        .get(&req.worker_id)
        .filter(|m| !m.dead)
        .map(|m| m.max_concurrency)
        .unwrap_or(0);

    if active_for_worker as u32 >= max_for_worker {
        info!(
            "worker {} pidió tarea pero ya tiene {}/{} en vuelo",
            req.worker_id, active_for_worker, max_for_worker
        );
        return Json(TaskAssignmentResponse { task: None });
    }

    // 3) Sacar la siguiente tarea de la cola global
    let task_opt = lock(&state.tasks_queue).pop_front();

    if let Some(ref t) = task_opt {
        info!(
            "asignando tarea {} (job={}, input={}, attempt={}) al worker {} ({}/{} en vuelo -> +1)",
            t.id, t.job_id, t.input_path, t.attempt, req.worker_id, active_for_worker, max_for_worker,
        );

        // 4) Registrar la tarea en in_flight con timestamp de inicio
        lock(&state.in_flight).insert(
            t.id.clone(),
            InFlight {
                task: t.clone(),
                worker_id: req.worker_id.clone(),
                started_at: SystemTime::now(),
            },
        );

        // 5) Marcar el job como Running la primera vez
        if let Some(job) = lock(&state.jobs).get_mut(&t.job_id) {
            if job.status == JobStatus::Accepted {
                job.status = JobStatus::Running;
                job.started_at.get_or_insert_with(Utc::now);
            }
        }

        if let Some(meta) = lock(&state.workers).get_mut(&req.worker_id) {
            meta.tasks_started += 1;
        }
    }

    Json(TaskAssignmentResponse { task: task_opt })
}

// Worker reporta que terminó una tarea: commit de tarea, o abort y reintento
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, StatusCode> {
    let removed = lock(&state.in_flight).remove(&req.task_id);
    let Some(inflight) = removed else {
        // intento que el failover ya dio por perdido: lo que haya escrito no cuenta
        if let (Some(record), Some(run)) = (&req.output, state.run(&req.job_id)) {
            warn!(
                "reporte tardío de la tarea {} (intento {}), se descarta su salida",
                req.task_id, record.task_attempt_id
            );
            driver::abort_attempt(&run, &record.db_table, &record.task_attempt_id).await;
        }
        return Err(StatusCode::NOT_FOUND);
    };

    let task = inflight.task;
    let duration_ms = inflight
        .started_at
        .elapsed()
        .map(|d| d.as_millis())
        .unwrap_or(0);

    if let Some(meta) = lock(&state.workers).get_mut(&inflight.worker_id) {
        if req.success {
            meta.tasks_succeeded += 1;
        } else {
            meta.tasks_failed += 1;
        }
    }
    info!(
        "tarea {} del job {} terminó en {} ms (success={})",
        task.id, task.job_id, duration_ms, req.success
    );

    match (req.success, req.output) {
        (true, Some(record)) => driver::accept_output(&state, task, record).await,
        (true, None) => {
            driver::retry_or_fail(&state, task, "task reported success without output".into(), false)
                .await
        }
        (false, _) => {
            let error = req.error.unwrap_or_else(|| "task failed".into());
            driver::retry_or_fail(&state, task, error, req.fatal).await
        }
    }

    Ok(Json(TaskCompleteResponse { ok: true }))
}
