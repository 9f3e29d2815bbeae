//! Adaptación del protocolo de commit a cada engine.
//!
//! - `mr`: llama a los callbacks del committer (tarea y job).
//! - `tez`: no llama ningún callback; el commit por tabla se engancha al hook
//!   de table-commit y el abort al hook de fallo que instalamos en el setup.
//!   El abort de un intento sí libera su artefacto.
//! - `spark`: las tablas de salida (append / overwrite) llegan por el side
//!   file escrito en el planning.

use tracing::{debug, info, warn};

use crate::commit::{CommitCoordinator, CommitOutcome};
use crate::config::{ExecutionEngine, HookSet, FAILURE_HOOK, POST_EXEC_HOOK, TABLE_COMMIT_HOOK};
use crate::error::{ConnectorError, Result};
use crate::side_file::SparkJobFile;
use crate::task::TaskOutputRecord;

pub type TableOutcomes = Vec<(String, CommitOutcome)>;

pub trait CommitTrigger: Send + Sync {
    fn engine(&self) -> ExecutionEngine;

    /// Hooks que el engine tiene que disparar para este trigger.
    fn register_hooks(&self, hooks: &mut HookSet);

    fn on_task_commit(&self, coord: &CommitCoordinator, record: &TaskOutputRecord) -> Result<()> {
        coord.commit_task(record)
    }

    fn on_task_abort(&self, coord: &CommitCoordinator, db_table: &str, task_attempt_id: &str) -> Result<()> {
        coord.abort_task(db_table, task_attempt_id).map(|_| ())
    }

    /// Callback de commit del job (todas las tareas terminaron bien).
    fn on_job_commit(&self, coord: &CommitCoordinator, tables: &[String]) -> Result<TableOutcomes>;

    /// Callback de abort del job. Nunca falla.
    fn on_job_abort(&self, coord: &CommitCoordinator, tables: &[String]);

    /// Hook de table-commit, una vez por tabla de salida.
    fn on_table_commit_hook(
        &self,
        _coord: &CommitCoordinator,
        db_table: &str,
        _overwrite: bool,
    ) -> Result<Option<CommitOutcome>> {
        debug!(engine = %self.engine(), table = db_table, "hook de table-commit ignorado");
        Ok(None)
    }

    /// Hook de fallo del job.
    fn on_failure_hook(&self, _coord: &CommitCoordinator, _tables: &[String]) {
        debug!(engine = %self.engine(), "hook de fallo ignorado");
    }

    /// Fin del query (post-exec): limpia el estado a nivel query.
    fn on_query_complete(&self, coord: &CommitCoordinator) {
        let report = coord.cleanup().clean_up_query();
        if !report.is_clean() {
            warn!(failed = ?report.failed, "cleanup del query incompleto");
        }
    }
}

/// Commitea las tablas en orden; si una falla, abandona las que faltan y
/// devuelve el error.
fn finish_tables<I>(coord: &CommitCoordinator, tables: I) -> Result<TableOutcomes>
where
    I: IntoIterator<Item = (String, Option<bool>)>,
{
    let mut done = Vec::new();
    let mut pending = tables.into_iter();
    while let Some((table, overwrite)) = pending.next() {
        match coord.finish_table(&table, overwrite) {
            Ok(outcome) => done.push((table, outcome)),
            Err(e) => {
                for (rest, _) in pending {
                    coord.abandon_table(&rest);
                }
                return Err(e);
            }
        }
    }
    Ok(done)
}

/* =========================
   mr: callbacks
   ========================= */

pub struct CallbackTrigger;

impl CommitTrigger for CallbackTrigger {
    fn engine(&self) -> ExecutionEngine {
        ExecutionEngine::Mr
    }

    fn register_hooks(&self, hooks: &mut HookSet) {
        hooks.add_post_exec_hook(POST_EXEC_HOOK);
    }

    fn on_job_commit(&self, coord: &CommitCoordinator, tables: &[String]) -> Result<TableOutcomes> {
        if !coord.config().output_job() {
            info!(query_id = coord.config().query_id(), "no es un output job, commit ignorado");
            return Ok(Vec::new());
        }
        finish_tables(coord, tables.iter().map(|t| (t.clone(), None)))
    }

    fn on_job_abort(&self, coord: &CommitCoordinator, tables: &[String]) {
        if !coord.config().output_job() {
            info!(query_id = coord.config().query_id(), "no es un output job, abort ignorado");
            return;
        }
        for t in tables {
            coord.abandon_table(t);
        }
    }
}

/* =========================
   tez: hooks
   ========================= */

pub struct HookTrigger;

impl HookTrigger {
    fn check_registered(coord: &CommitCoordinator) -> Result<()> {
        if coord.config().hooks().has_table_commit_hook() {
            Ok(())
        } else {
            Err(ConnectorError::configuration(format!(
                "hook {TABLE_COMMIT_HOOK} is not registered for query {}",
                coord.config().query_id()
            )))
        }
    }
}

impl CommitTrigger for HookTrigger {
    fn engine(&self) -> ExecutionEngine {
        ExecutionEngine::Tez
    }

    fn register_hooks(&self, hooks: &mut HookSet) {
        hooks.add_failure_hook(FAILURE_HOOK);
        hooks.add_table_commit_hook(TABLE_COMMIT_HOOK);
        hooks.add_post_exec_hook(POST_EXEC_HOOK);
    }

    // este engine no invoca callbacks de tarea
    fn on_task_commit(&self, _coord: &CommitCoordinator, record: &TaskOutputRecord) -> Result<()> {
        debug!(attempt = %record.task_attempt_id, "commit de tarea ignorado (engine con hooks)");
        Ok(())
    }

    // el engine no lo dispara, pero el master aborta los intentos perdidos y
    // el hook de tabla carga todo lo que quede en el staging
    fn on_task_abort(&self, coord: &CommitCoordinator, db_table: &str, task_attempt_id: &str) -> Result<()> {
        coord.abort_task(db_table, task_attempt_id).map(|_| ())
    }

    fn on_job_commit(&self, _coord: &CommitCoordinator, _tables: &[String]) -> Result<TableOutcomes> {
        debug!("commit de job ignorado, se espera el hook de table-commit");
        Ok(Vec::new())
    }

    fn on_job_abort(&self, _coord: &CommitCoordinator, _tables: &[String]) {
        debug!("abort de job ignorado, se espera el hook de fallo");
    }

    fn on_table_commit_hook(
        &self,
        coord: &CommitCoordinator,
        db_table: &str,
        overwrite: bool,
    ) -> Result<Option<CommitOutcome>> {
        Self::check_registered(coord)?;
        coord.finish_table(db_table, Some(overwrite)).map(Some)
    }

    fn on_failure_hook(&self, coord: &CommitCoordinator, tables: &[String]) {
        if !coord.config().hooks().has_failure_hook() {
            warn!(query_id = coord.config().query_id(), "hook de fallo disparado sin estar registrado");
        }
        for t in tables {
            coord.abandon_table(t);
        }
    }
}

/* =========================
   spark: side file
   ========================= */

pub struct SideFileTrigger;

impl CommitTrigger for SideFileTrigger {
    fn engine(&self) -> ExecutionEngine {
        ExecutionEngine::SparkSql
    }

    fn register_hooks(&self, _hooks: &mut HookSet) {}

    /// Las tablas (y si van con overwrite) salen del side file; `tables` sólo
    /// se usa para abandonar si el side file no está.
    fn on_job_commit(&self, coord: &CommitCoordinator, tables: &[String]) -> Result<TableOutcomes> {
        let side = match SparkJobFile::read(coord.config()) {
            Ok(s) => s,
            Err(e) => {
                for t in tables {
                    coord.abandon_table(t);
                }
                return Err(e);
            }
        };
        finish_tables(
            coord,
            side.tables().into_iter().map(|t| {
                let overwrite = side.is_overwrite(&t);
                (t, Some(overwrite))
            }),
        )
    }

    fn on_job_abort(&self, coord: &CommitCoordinator, tables: &[String]) {
        let mut all: Vec<String> = tables.to_vec();
        match SparkJobFile::read(coord.config()) {
            Ok(side) => {
                for t in side.tables() {
                    if !all.contains(&t) {
                        all.push(t);
                    }
                }
            }
            Err(e) => warn!(error = %e, "abort sin side file, se usan las tablas conocidas"),
        }
        for t in &all {
            coord.abandon_table(t);
        }
    }
}

pub fn select_trigger(engine: ExecutionEngine) -> Box<dyn CommitTrigger> {
    match engine {
        ExecutionEngine::Mr => Box::new(CallbackTrigger),
        ExecutionEngine::Tez => Box::new(HookTrigger),
        ExecutionEngine::SparkSql => Box::new(SideFileTrigger),
    }
}
