use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ExecutionEngine, WriteStrategy};
use crate::schema::{Partitioning, TableSchema};

pub type JobId = String;

/// Pedido de escritura: cargar los archivos de `input_glob` en `table`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteJobRequest {
    pub name: String,

    /// Tabla destino, `proyecto.dataset.tabla`
    pub table: String,

    /// Nombre `db.table` del lado del engine; por defecto `dataset.tabla`
    #[serde(default)]
    pub db_table: Option<String>,

    /// Patrón de archivos de entrada, ej: "/data/input/*.jsonl"
    pub input_glob: String,

    #[serde(default)]
    pub overwrite: bool,

    /// Si no vienen, se usan los de la config del master (env)
    #[serde(default)]
    pub engine: Option<ExecutionEngine>,
    #[serde(default)]
    pub write_method: Option<WriteStrategy>,

    /// Schema para crear la tabla si no existe
    #[serde(default)]
    pub create_schema: Option<TableSchema>,
    #[serde(default)]
    pub partitioning: Option<Partitioning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Accepted,
    Running,
    /// Todas las tareas terminaron; se está haciendo el commit.
    Committing,
    Failed,
    Succeeded,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,

    pub table: String,
    pub db_table: String,
    pub engine: ExecutionEngine,
    pub write_method: WriteStrategy,
    pub overwrite: bool,
    pub input_glob: String,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub retries: u32,

    /// Filas que quedaron visibles con el commit
    pub rows_committed: Option<u64>,
    pub error: Option<String>,
}
