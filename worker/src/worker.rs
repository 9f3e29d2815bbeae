use anyhow::Result;
use common::{
    input, ConnectorError, DescriptorLocation, JobConfigBuilder, LocalWarehouse, Task,
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, WarehouseClient,
    WorkerHeartbeatRequest, WorkerRegisterRequest, WorkerRegisterResponse,
};
use common::writer::write_task_output;
use reqwest::{Client, StatusCode};
use std::{env, path::Path, sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_WAREHOUSE_ROOT: &str = "/data/warehouse";

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide tareas mientras tenga "slots" libres.
/// - Escribe cada tarea en paralelo (hasta WORKER_CONCURRENCY) y reporta el artefacto.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "worker=debug,common=info".into()))
        .init();

    let base_url =
        env::var("MASTER_BASE_URL").unwrap_or_else(|_| "http://master:8080".to_string());
    let client = Client::new();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let max_concurrency: u32 = env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

    // mismo warehouse y mismos directorios de trabajo que el master
    let warehouse_root = env::var("WAREHOUSE_ROOT").unwrap_or_else(|_| DEFAULT_WAREHOUSE_ROOT.into());
    let warehouse: Arc<dyn WarehouseClient> = Arc::new(LocalWarehouse::new(&warehouse_root));
    let defaults = JobConfigBuilder::from_env("");

    let mut worker_id = register(&client, &base_url, &hostname, max_concurrency).await?;

    let sem = Arc::new(Semaphore::new(max_concurrency as usize));

    loop {
        // --------- Heartbeat al master ---------
        let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);
        match client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await
        {
            Ok(r) if r.status() == StatusCode::NOT_FOUND => {
                // el master no nos conoce (se reinició): registro nuevo
                warn!("master no reconoce al worker {}, registrando de nuevo", worker_id);
                match register(&client, &base_url, &hostname, max_concurrency).await {
                    Ok(id) => worker_id = id,
                    Err(e) => warn!("no se pudo registrar de nuevo: {:?}", e),
                }
            }
            Ok(r) if !r.status().is_success() => {
                warn!("heartbeat rechazado por el master ({})", r.status())
            }
            Err(e) => warn!("error HTTP en heartbeat: {:?}", e),
            Ok(_) => {}
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                // No hay capacidad para nuevas tareas; esperamos un poco
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        // Pedimos tarea al master
        let assign_url = format!("{}/api/v1/tasks/next", base_url);
        let res = client
            .post(&assign_url)
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await?;

        let assignment: TaskAssignmentResponse = res.json().await?;

        if let Some(task) = assignment.task {
            info!(
                "tengo tarea {} del job {} (input={}, attempt={})",
                task.id, task.job_id, task.input_path, task.attempt
            );

            let client_cloned = client.clone();
            let base_url_cloned = base_url.clone();
            let warehouse = warehouse.clone();
            let defaults = defaults.clone();

            tokio::spawn(async move {
                let task_id = task.id.clone();
                let job_id = task.job_id.clone();

                // 1) Escribir el artefacto en un hilo de bloqueo
                let handle =
                    tokio::task::spawn_blocking(move || execute_task(&defaults, warehouse.as_ref(), &task));
                let report = match handle.await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!("panic o join error en tarea {}: {:?}", task_id, e);
                        TaskCompleteRequest {
                            task_id: task_id.clone(),
                            job_id,
                            success: false,
                            output: None,
                            error: Some(format!("worker panicked: {e}")),
                            fatal: false,
                        }
                    }
                };

                // 2) Reportar al master
                let complete_url = format!("{}/api/v1/tasks/complete", base_url_cloned);
                if let Err(e) = client_cloned.post(&complete_url).json(&report).send().await {
                    warn!("no se pudo reportar la tarea {}: {:?}", task_id, e);
                }

                // 3) Liberar el "slot" de concurrencia al terminar
                drop(permit);
            });
        } else {
            // No hay tarea: devolvemos el permiso y dormimos
            drop(permit);
            sleep(Duration::from_secs(2)).await;
        }
    }
}

/// Registro de worker (enviando max_concurrency); devuelve el id asignado.
async fn register(
    client: &Client,
    base_url: &str,
    hostname: &str,
    max_concurrency: u32,
) -> Result<String> {
    let register_url = format!("{}/api/v1/workers/register", base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname: hostname.to_string(),
            max_concurrency,
        })
        .send()
        .await?
        .error_for_status()?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;

    info!(
        "worker {} registrado con concurrency={} contra {}",
        worker_id, max_concurrency, base_url
    );
    Ok(worker_id)
}

/// Corre un intento: lee el descriptor que dejó el setup, convierte las
/// filas de entrada y las escribe con el task writer. Nunca falla: el
/// resultado va en el reporte para el master.
pub fn execute_task(
    defaults: &JobConfigBuilder,
    warehouse: &dyn WarehouseClient,
    task: &Task,
) -> TaskCompleteRequest {
    let result = write_attempt(defaults, warehouse, task);

    let (success, output, error, fatal) = match result {
        Ok(record) => {
            info!(
                "terminé tarea {} ({} filas en {})",
                task.id,
                record.row_count,
                record.artifact.local_path().display()
            );
            (true, Some(record), None, false)
        }
        Err(e) => {
            warn!("error procesando tarea {}: {}", task.id, e);
            // sin descriptor el job está roto: reintentar no sirve
            let fatal = matches!(e, ConnectorError::MissingJobState { .. });
            (false, None, Some(e.to_string()), fatal)
        }
    };

    TaskCompleteRequest {
        task_id: task.id.clone(),
        job_id: task.job_id.clone(),
        success,
        output,
        error,
        fatal,
    }
}

fn write_attempt(
    defaults: &JobConfigBuilder,
    warehouse: &dyn WarehouseClient,
    task: &Task,
) -> common::Result<common::TaskOutputRecord> {
    let config = defaults.clone().query_id(task.job_id.clone()).build();
    let descriptor = DescriptorLocation::for_table(&config, &task.db_table).load()?;
    let rows = input::read_rows(Path::new(&task.input_path), descriptor.schema())?;
    write_task_output(
        &descriptor,
        warehouse,
        &task.attempt_id(),
        0,
        config.stream_batch_rows(),
        rows.into_iter().map(Ok),
    )
}
