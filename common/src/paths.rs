//! Rutas deterministas del estado compartido de un job.
//!
//! Todo proceso (master, workers, hooks) calcula las mismas rutas a partir de
//! `(JobConfig, db.table)`; no hay ningún handle en memoria compartida.
//!
//! ```text
//! {workDirParent}/{prefix}{queryId}/                 <- query work dir
//!     spark-job.json                                 <- side file
//!     {db.table}/job-details.json                    <- descriptor
//!     {db.table}/{tablePrefix}_{attempt}_{w}.stream  <- refs de streams (direct)
//! {stagingRoot}/{prefix}{queryId}/{db.table}/        <- archivos staged
//! ```

use std::path::{Path, PathBuf};

use crate::config::{JobConfig, WriteStrategy, JOB_DETAILS_FILE, SIDE_FILE_NAME};
use crate::error::{ConnectorError, Result};
use crate::schema::TableId;

/// Sufijo de los archivos de referencia a streams (camino directo).
pub const STREAM_REF_SUFFIX: &str = "stream";
/// Sufijo de los archivos staged.
pub const STAGED_SUFFIX: &str = "jsonl";
/// Prefijo de archivos en escritura. Los listados lo ignoran.
pub const IN_PROGRESS_PREFIX: &str = "_inprogress.";

fn query_dir_name(config: &JobConfig) -> String {
    format!("{}{}", config.work_dir_prefix(), config.query_id())
}

pub fn query_work_dir(config: &JobConfig) -> PathBuf {
    config.work_dir_parent().join(query_dir_name(config))
}

pub fn table_work_dir(config: &JobConfig, db_table: &str) -> PathBuf {
    query_work_dir(config).join(db_table)
}

pub fn descriptor_path(config: &JobConfig, db_table: &str) -> PathBuf {
    table_work_dir(config, db_table).join(JOB_DETAILS_FILE)
}

pub fn side_file_path(config: &JobConfig) -> PathBuf {
    query_work_dir(config).join(SIDE_FILE_NAME)
}

/// Directorio de staging del query, si hay staging root configurado.
pub fn query_staging_dir(config: &JobConfig) -> Option<PathBuf> {
    config
        .staging_root()
        .map(|root| root.join(query_dir_name(config)))
}

/// Directorio donde las tareas dejan sus artefactos para esta tabla.
pub fn job_temp_output_dir(
    config: &JobConfig,
    db_table: &str,
    strategy: WriteStrategy,
) -> Result<PathBuf> {
    match strategy {
        WriteStrategy::Direct => Ok(table_work_dir(config, db_table)),
        WriteStrategy::Staged => query_staging_dir(config)
            .map(|dir| dir.join(db_table))
            .ok_or_else(|| {
                ConnectorError::configuration(
                    "the staged write method requires STAGING_ROOT to be set",
                )
            }),
    }
}

/// Prefijo común a todos los artefactos de un intento de tarea.
pub fn task_attempt_prefix(table_id: &TableId, task_attempt_id: &str) -> String {
    format!("{}_{}_", table_id.prefix(), task_attempt_id)
}

pub fn task_artifact_name(
    table_id: &TableId,
    task_attempt_id: &str,
    writer_id: u32,
    suffix: &str,
) -> String {
    format!(
        "{}{}.{}",
        task_attempt_prefix(table_id, task_attempt_id),
        writer_id,
        suffix
    )
}

pub fn task_artifact_path(
    dir: &Path,
    table_id: &TableId,
    task_attempt_id: &str,
    writer_id: u32,
    suffix: &str,
) -> PathBuf {
    dir.join(task_artifact_name(table_id, task_attempt_id, writer_id, suffix))
}

/// Nombre oculto con el que se escribe un artefacto hasta cerrarlo.
pub fn in_progress_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!("{IN_PROGRESS_PREFIX}{name}"))
}

/// Tabla temporal del warehouse para overwrites staged.
pub fn scratch_table_id(table_id: &TableId, query_id: &str) -> TableId {
    let sanitized: String = query_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    table_id.with_table(format!("{}_tmp_{}", table_id.table, sanitized))
}
