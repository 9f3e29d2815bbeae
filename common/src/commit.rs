//! Coordinador de commit: protocolo de dos niveles (tarea, job) que convierte
//! los artefactos de todas las tareas en una única mutación atómica de la
//! tabla, o en nada si el job se aborta.

use std::{
    collections::HashMap,
    fs,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupCoordinator, CleanupReport};
use crate::config::{JobConfig, WriteStrategy};
use crate::descriptor::{DescriptorLocation, JobDescriptor};
use crate::error::{ConnectorError, Result};
use crate::paths::{self, STREAM_REF_SUFFIX};
use crate::staged::{self, StreamRefFile};
use crate::task::TaskOutputRecord;
use crate::warehouse::{LoadOptions, StreamRef, WarehouseClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitState {
    #[default]
    Pending,
    TaskCommitting,
    TaskCommitted,
    JobCommitting,
    Committed,
    Aborting,
    Aborted,
}

impl CommitState {
    pub fn can_transition_to(self, next: CommitState) -> bool {
        use CommitState::*;
        matches!(
            (self, next),
            (Pending | TaskCommitted, TaskCommitting)
                | (TaskCommitting, TaskCommitted)
                | (Pending | TaskCommitted, JobCommitting)
                | (JobCommitting, Committed)
                | (
                    Pending | TaskCommitting | TaskCommitted | JobCommitting | Aborted,
                    Aborting
                )
                | (Aborting, Aborted)
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Filas que pasaron a ser visibles con este commit.
    pub rows: u64,
    /// Artefactos de tareas incluidos.
    pub artifacts: usize,
    /// El commit ya había ocurrido antes en este proceso.
    pub already_committed: bool,
}

pub struct CommitCoordinator {
    config: Arc<JobConfig>,
    warehouse: Arc<dyn WarehouseClient>,
    cleanup: CleanupCoordinator,
    states: Mutex<HashMap<String, CommitState>>,
}

impl CommitCoordinator {
    pub fn new(config: Arc<JobConfig>, warehouse: Arc<dyn WarehouseClient>) -> Self {
        let cleanup = CleanupCoordinator::new(config.clone(), warehouse.clone());
        Self {
            config,
            warehouse,
            cleanup,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &dyn WarehouseClient {
        self.warehouse.as_ref()
    }

    pub fn cleanup(&self) -> &CleanupCoordinator {
        &self.cleanup
    }

    fn states(&self) -> Result<MutexGuard<'_, HashMap<String, CommitState>>> {
        self.states
            .lock()
            .map_err(|_| ConnectorError::illegal_state("commit state lock poisoned"))
    }

    pub fn state(&self, db_table: &str) -> CommitState {
        self.states()
            .ok()
            .and_then(|s| s.get(db_table).copied())
            .unwrap_or_default()
    }

    fn transition(
        states: &mut HashMap<String, CommitState>,
        db_table: &str,
        next: CommitState,
    ) -> Result<CommitState> {
        let current = states.get(db_table).copied().unwrap_or_default();
        if !current.can_transition_to(next) {
            return Err(ConnectorError::illegal_state(format!(
                "table {db_table}: cannot go from {current:?} to {next:?}"
            )));
        }
        states.insert(db_table.to_string(), next);
        Ok(current)
    }

    fn set_state(&self, db_table: &str, next: CommitState) -> Result<CommitState> {
        Self::transition(&mut *self.states()?, db_table, next)
    }

    /* =========================
       Nivel tarea
       ========================= */

    /// Acepta el artefacto de un intento: tiene que existir en disco.
    pub fn commit_task(&self, record: &TaskOutputRecord) -> Result<()> {
        let mut states = self.states()?;
        let db_table = record.db_table.as_str();
        Self::transition(&mut states, db_table, CommitState::TaskCommitting)?;

        let path = record.artifact.local_path();
        let verified = if path.is_file() {
            Ok(())
        } else {
            Err(ConnectorError::illegal_state(format!(
                "task attempt {} reported artifact {} but it does not exist",
                record.task_attempt_id,
                path.display()
            )))
        };

        Self::transition(&mut states, db_table, CommitState::TaskCommitted)?;
        if verified.is_ok() {
            debug!(
                table = db_table,
                attempt = %record.task_attempt_id,
                rows = record.row_count,
                "tarea commiteada"
            );
        }
        verified
    }

    /// Descarta todo lo que haya dejado un intento (terminado o a medias).
    /// Devuelve cuántos artefactos se liberaron.
    pub fn abort_task(&self, db_table: &str, task_attempt_id: &str) -> Result<usize> {
        let descriptor = match DescriptorLocation::for_table(&self.config, db_table).load() {
            Ok(d) => d,
            Err(ConnectorError::MissingJobState { .. }) => {
                debug!(table = db_table, attempt = task_attempt_id, "abort de tarea sin descriptor, nada que liberar");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let prefix = paths::task_attempt_prefix(descriptor.table_id(), task_attempt_id);
        let released = self.release_artifacts(&descriptor, &prefix)?;
        info!(table = db_table, attempt = task_attempt_id, released, "tarea abortada");
        Ok(released)
    }

    /// Borra archivos con `prefix` en el temp output del descriptor,
    /// descartando antes los streams que referencian.
    fn release_artifacts(&self, descriptor: &JobDescriptor, prefix: &str) -> Result<usize> {
        let suffix = format!(".{STREAM_REF_SUFFIX}");
        let mut released = 0;
        for path in staged::list_all_with_prefix(descriptor.temp_output_dir(), prefix)? {
            let is_stream_ref = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && n.ends_with(&suffix));
            if is_stream_ref {
                match StreamRefFile::read(&path) {
                    Ok(r) => {
                        if let Err(e) = self
                            .warehouse
                            .discard(descriptor.table_id(), &StreamRef::new(r.stream.clone()))
                        {
                            warn!(stream = %r.stream, error = %e, "no se pudo descartar el stream");
                        }
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "referencia a stream ilegible"),
                }
            }
            match fs::remove_file(&path) {
                Ok(()) => released += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "no se pudo borrar artefacto"),
            }
        }
        Ok(released)
    }

    /* =========================
       Nivel job
       ========================= */

    /// Mutación atómica de la tabla con los artefactos de todas las tareas.
    /// Si el warehouse falla se aborta el job y se devuelve el error original.
    pub fn commit_job(&self, descriptor: &JobDescriptor, overwrite: bool) -> Result<CommitOutcome> {
        let db_table = descriptor.db_table_name();
        {
            let mut states = self.states()?;
            if states.get(db_table) == Some(&CommitState::Committed) {
                debug!(table = db_table, "job ya commiteado, no se repite");
                return Ok(CommitOutcome {
                    already_committed: true,
                    ..CommitOutcome::default()
                });
            }
            Self::transition(&mut states, db_table, CommitState::JobCommitting)?;
        }

        info!(
            query_id = descriptor.query_id(),
            table = %descriptor.table_id(),
            strategy = %descriptor.write_strategy(),
            overwrite,
            "commit de job"
        );

        let result = match descriptor.write_strategy() {
            WriteStrategy::Staged => self.commit_staged(descriptor, overwrite),
            WriteStrategy::Direct => self.commit_direct(descriptor, overwrite),
        };

        match result {
            Ok(outcome) => {
                self.set_state(db_table, CommitState::Committed)?;
                info!(
                    table = %descriptor.table_id(),
                    rows = outcome.rows,
                    artifacts = outcome.artifacts,
                    "job commiteado"
                );
                Ok(outcome)
            }
            Err(e) => {
                let err = match e {
                    ConnectorError::Warehouse { message } => ConnectorError::WarehouseCommit {
                        table: descriptor.table_id().to_string(),
                        message,
                    },
                    other => other,
                };
                warn!(table = %descriptor.table_id(), error = %err, "commit de job falló, abortando");
                self.abort_job(descriptor);
                Err(err)
            }
        }
    }

    fn commit_staged(&self, descriptor: &JobDescriptor, overwrite: bool) -> Result<CommitOutcome> {
        let table_id = descriptor.table_id();
        let prefix = format!("{}_", table_id.prefix());
        // una tarea caída no dejó archivo terminado: no aporta nada
        let files = staged::list_staged_artifacts(descriptor.temp_output_dir(), &prefix)?;
        if files.is_empty() {
            info!(table = %table_id, "sin archivos staged, no se toca la tabla");
            return Ok(CommitOutcome::default());
        }

        let options = LoadOptions {
            overwrite: true,
            delete_source_files: true,
        };
        let result = if overwrite {
            // carga en una tabla temporal y reemplazo: nunca hay visibilidad parcial
            let scratch = paths::scratch_table_id(table_id, descriptor.query_id());
            if self.warehouse.get_table(&scratch)?.is_some() {
                // resto de un intento anterior de este mismo query
                self.warehouse.delete_table(&scratch)?;
            }
            self.warehouse.create_table(&scratch, descriptor.schema(), None)?;
            let loaded = self.warehouse.load_from_files(&scratch, &files, options)?;
            self.warehouse.replace_table(table_id, &scratch)?;
            loaded
        } else {
            self.warehouse.load_from_files(
                table_id,
                &files,
                LoadOptions {
                    overwrite: false,
                    ..options
                },
            )?
        };

        Ok(CommitOutcome {
            rows: result.rows_loaded,
            artifacts: files.len(),
            already_committed: false,
        })
    }

    fn commit_direct(&self, descriptor: &JobDescriptor, overwrite: bool) -> Result<CommitOutcome> {
        let table_id = descriptor.table_id();
        let prefix = format!("{}_", table_id.prefix());
        let refs = staged::list_stream_refs(descriptor.temp_output_dir(), &prefix)?;
        if refs.is_empty() {
            info!(table = %table_id, "sin streams pendientes, no se toca la tabla");
            return Ok(CommitOutcome::default());
        }
        let streams: Vec<StreamRef> = refs.iter().map(|(_, r)| StreamRef::new(r.stream.clone())).collect();
        let rows = self.warehouse.finalize(table_id, &streams, overwrite)?;
        Ok(CommitOutcome {
            rows,
            artifacts: refs.len(),
            already_committed: false,
        })
    }

    /// Aborta la contribución de todas las tareas. Nunca falla: cada error se
    /// loguea, para no tapar el fallo que provocó el abort.
    pub fn abort_job(&self, descriptor: &JobDescriptor) -> usize {
        let db_table = descriptor.db_table_name();
        if self.state(db_table) == CommitState::Committed {
            warn!(table = db_table, "abort después del commit: la escritura ya es visible, no se deshace");
            return 0;
        }
        if let Err(e) = self.set_state(db_table, CommitState::Aborting) {
            warn!(table = db_table, error = %e, "abort de job en estado inesperado");
        }

        let prefix = format!("{}_", descriptor.table_id().prefix());
        let released = match self.release_artifacts(descriptor, &prefix) {
            Ok(n) => n,
            Err(e) => {
                warn!(table = db_table, error = %e, "no se pudieron listar los artefactos del job");
                0
            }
        };

        if let Err(e) = self.set_state(db_table, CommitState::Aborted) {
            warn!(table = db_table, error = %e, "abort de job en estado inesperado");
        }
        info!(table = db_table, released, "job abortado");
        released
    }

    /* =========================
       Helpers por tabla
       ========================= */

    /// Carga el descriptor, commitea y limpia (la limpieza corre siempre).
    /// `overwrite = None` usa el flag del descriptor.
    pub fn finish_table(&self, db_table: &str, overwrite: Option<bool>) -> Result<CommitOutcome> {
        let descriptor = match DescriptorLocation::for_table(&self.config, db_table).load() {
            Ok(d) => d,
            Err(e) => {
                let report = self
                    .cleanup
                    .clean_up_table(db_table, None, overwrite.unwrap_or(false));
                log_report(db_table, &report);
                return Err(e);
            }
        };
        let overwrite = overwrite.unwrap_or(descriptor.overwrite());
        let result = self.commit_job(&descriptor, overwrite);
        let report = self.cleanup.clean_up_table(db_table, Some(&descriptor), overwrite);
        log_report(db_table, &report);
        result
    }

    /// Aborta y limpia. Nunca falla.
    pub fn abandon_table(&self, db_table: &str) -> usize {
        let (released, report) = match DescriptorLocation::for_table(&self.config, db_table).load() {
            Ok(desc) => {
                let released = self.abort_job(&desc);
                (released, self.cleanup.clean_up_table(db_table, Some(&desc), desc.overwrite()))
            }
            Err(e) => {
                debug!(table = db_table, error = %e, "abandono sin descriptor");
                (0, self.cleanup.clean_up_table(db_table, None, false))
            }
        };
        log_report(db_table, &report);
        released
    }
}

fn log_report(db_table: &str, report: &CleanupReport) {
    if !report.is_clean() {
        warn!(
            table = db_table,
            failed = ?report.failed,
            "cleanup incompleto (el resultado del job no cambia)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSchema, FieldType, TableId, TableSchema};
    use crate::task::OutputArtifact;
    use crate::warehouse::LocalWarehouse;
    use tempfile::TempDir;

    #[test]
    fn transiciones_permitidas() {
        use CommitState::*;
        assert!(Pending.can_transition_to(TaskCommitting));
        assert!(TaskCommitting.can_transition_to(TaskCommitted));
        assert!(TaskCommitted.can_transition_to(JobCommitting));
        assert!(JobCommitting.can_transition_to(Committed));
        assert!(JobCommitting.can_transition_to(Aborting));
        assert!(Aborted.can_transition_to(Aborting));
        assert!(!Committed.can_transition_to(Aborting));
        assert!(!Committed.can_transition_to(JobCommitting));
        assert!(!Aborted.can_transition_to(JobCommitting));
        assert!(!TaskCommitting.can_transition_to(JobCommitting));
        assert!(!Pending.can_transition_to(Committed));
    }

    #[test]
    fn commit_task_con_artefacto_inexistente_falla() {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let config = Arc::new(JobConfig::builder("q").work_dir_parent(work.path()).build());
        let coord = CommitCoordinator::new(config, Arc::new(LocalWarehouse::new(root.path())));
        let rec = TaskOutputRecord {
            db_table: "db.t".into(),
            task_attempt_id: "attempt_00000_0".into(),
            writer_id: 0,
            artifact: OutputArtifact::StagedFile {
                path: work.path().join("no-existe.jsonl"),
            },
            row_count: 1,
        };
        assert!(coord.commit_task(&rec).is_err());
        // el estado queda consistente para otras tareas
        assert_eq!(coord.state("db.t"), CommitState::TaskCommitted);
    }

    #[test]
    fn abort_despues_del_commit_no_hace_nada() {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let config = Arc::new(JobConfig::builder("q").work_dir_parent(work.path()).build());
        let warehouse = Arc::new(LocalWarehouse::new(root.path()));
        let table_id = TableId::new("p", "d", "t");
        let schema = TableSchema::new(vec![FieldSchema::new("n", FieldType::Integer)]);
        warehouse.create_table(&table_id, &schema, None).unwrap();
        let desc = JobDescriptor::create(&config, "db.t", table_id, schema, WriteStrategy::Direct, false)
            .unwrap();

        let coord = CommitCoordinator::new(config, warehouse);
        let first = coord.commit_job(&desc, false).unwrap();
        assert!(!first.already_committed);
        let second = coord.commit_job(&desc, false).unwrap();
        assert!(second.already_committed);
        assert_eq!(coord.abort_job(&desc), 0);
        assert_eq!(coord.state("db.t"), CommitState::Committed);
    }
}
