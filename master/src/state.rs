// master/src/state.rs

use common::{
    CommitCoordinator, CommitTrigger, JobConfig, JobConfigBuilder, JobId, JobInfo, Task, TaskId,
    WarehouseClient, WorkerId,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::SystemTime,
};

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<Mutex<HashMap<JobId, JobInfo>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // tareas pendientes de asignar
    pub tasks_queue: Arc<Mutex<VecDeque<Task>>>,
    // tareas ya asignadas pero no completadas
    pub in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
    // protocolo de commit de cada job que todavía no terminó
    pub runs: Arc<Mutex<HashMap<JobId, JobRun>>>,

    pub warehouse: Arc<dyn WarehouseClient>,
    /// Config base (env del master); cada job le pone su query id y overrides.
    pub job_defaults: JobConfigBuilder,
}

impl AppState {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, job_defaults: JobConfigBuilder) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            tasks_queue: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            runs: Arc::new(Mutex::new(HashMap::new())),
            warehouse,
            job_defaults,
        }
    }

    pub fn run(&self, job_id: &str) -> Option<JobRun> {
        lock(&self.runs).get(job_id).cloned()
    }
}

/// Un lock envenenado no invalida los mapas: cada handler deja el estado
/// consistente antes de cualquier operación que pueda paniquear.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: Task,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}

/// Lado master del protocolo para un job: config congelada, coordinador y
/// trigger del engine.
#[derive(Clone)]
pub struct JobRun {
    pub db_table: String,
    pub overwrite: bool,
    pub config: Arc<JobConfig>,
    pub coordinator: Arc<CommitCoordinator>,
    pub trigger: Arc<dyn CommitTrigger>,
    // tareas sin resolver: en cola, en vuelo o con su reporte en proceso.
    // Un reintento no la toca; baja cuando la tarea se commitea o se
    // descarta para siempre
    open_tasks: Arc<AtomicUsize>,
}

impl JobRun {
    pub fn new(
        config: Arc<JobConfig>,
        warehouse: Arc<dyn WarehouseClient>,
        db_table: String,
        overwrite: bool,
        tasks: usize,
    ) -> Self {
        let trigger: Arc<dyn CommitTrigger> = Arc::from(common::select_trigger(config.engine()));
        Self {
            db_table,
            overwrite,
            coordinator: Arc::new(CommitCoordinator::new(config.clone(), warehouse)),
            config,
            trigger,
            open_tasks: Arc::new(AtomicUsize::new(tasks)),
        }
    }

    pub fn open_tasks(&self) -> usize {
        self.open_tasks.load(Ordering::SeqCst)
    }

    /// Da por resueltas `n` tareas; devuelve cuántas quedan abiertas.
    pub fn resolve_tasks(&self, n: usize) -> usize {
        let prev = self
            .open_tasks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| Some(open.saturating_sub(n)))
            .unwrap_or_else(|open| open);
        prev.saturating_sub(n)
    }
}
