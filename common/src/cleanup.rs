//! Limpieza best-effort del estado temporal de un job.
//!
//! Corre después del éxito y después del fallo, siempre. Cada paso va
//! envuelto en `safe_clean_up`: su error se loguea y se traga, nunca
//! convierte un job exitoso en fallido.

use std::{fmt, fs, path::Path, sync::Arc};
use tracing::{debug, info, warn};

use crate::config::JobConfig;
use crate::descriptor::{DescriptorLocation, JobDescriptor};
use crate::error::{io_err, ConnectorError, Result};
use crate::paths;
use crate::side_file::SparkJobFile;
use crate::staged;
use crate::warehouse::WarehouseClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    DeleteScratchTable,
    DeleteArtifacts,
    RemoveTempOutputDir,
    DeleteDescriptor,
    RemoveTableWorkDir,
    RemoveQueryStagingDir,
    DeleteSideFile,
    RemoveQueryWorkDir,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DeleteScratchTable => "delete warehouse temporary table for overwrite",
            Self::DeleteArtifacts => "delete task artifacts",
            Self::RemoveTempOutputDir => "remove temp output directory",
            Self::DeleteDescriptor => "delete job descriptor",
            Self::RemoveTableWorkDir => "remove table work directory",
            Self::RemoveQueryStagingDir => "remove query staging directory",
            Self::DeleteSideFile => "delete spark job file",
            Self::RemoveQueryWorkDir => "remove query work directory",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub attempted: Vec<CleanupStep>,
    pub failed: Vec<CleanupStep>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn run<F>(&mut self, step: CleanupStep, f: F)
    where
        F: FnOnce() -> Result<()>,
    {
        self.attempted.push(step);
        if !safe_clean_up(&step.to_string(), f) {
            self.failed.push(step);
        }
    }
}

/// Corre un paso de limpieza; devuelve si anduvo. Nunca propaga.
pub fn safe_clean_up<F>(step: &str, f: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    debug!(step, "cleanup: empezando");
    match f() {
        Ok(()) => true,
        Err(e) => {
            let err = ConnectorError::Cleanup {
                step: step.to_string(),
                message: e.to_string(),
            };
            warn!(error = %err, "cleanup: paso fallido, se ignora");
            false
        }
    }
}

/// Borra `dir` sólo si está vacío. Que no exista o tenga cosas no es error.
pub fn remove_dir_if_empty(dir: &Path) -> Result<bool> {
    let mut entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_err(dir)(e)),
    };
    if entries.next().is_some() {
        debug!(dir = %dir.display(), "directorio no vacío, se deja");
        return Ok(false);
    }
    match fs::remove_dir(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(dir)(e)),
    }
}

pub struct CleanupCoordinator {
    config: Arc<JobConfig>,
    warehouse: Arc<dyn WarehouseClient>,
}

impl CleanupCoordinator {
    pub fn new(config: Arc<JobConfig>, warehouse: Arc<dyn WarehouseClient>) -> Self {
        Self { config, warehouse }
    }

    /// Limpieza por tabla. Con `descriptor = None` (nunca se persistió o ya
    /// se borró) se limpia lo que se pueda derivar de la config.
    pub fn clean_up_table(
        &self,
        db_table: &str,
        descriptor: Option<&JobDescriptor>,
        overwrite: bool,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        let config = &self.config;
        let table_work_dir = paths::table_work_dir(config, db_table);
        let temp_output_dir = match descriptor {
            Some(d) => Some(d.temp_output_dir().to_path_buf()),
            None => paths::job_temp_output_dir(config, db_table, config.write_strategy()).ok(),
        };

        if let Some(desc) = descriptor {
            let table_id = desc.table_id();
            if overwrite {
                let scratch = paths::scratch_table_id(table_id, config.query_id());
                report.run(CleanupStep::DeleteScratchTable, || {
                    if self.warehouse.delete_table(&scratch)? {
                        info!(table = %scratch, "tabla temporal de overwrite borrada");
                    }
                    Ok(())
                });
            }

            let prefix = format!("{}_", table_id.prefix());
            let dir = desc.temp_output_dir();
            report.run(CleanupStep::DeleteArtifacts, || {
                for path in staged::list_all_with_prefix(dir, &prefix)? {
                    fs::remove_file(&path).map_err(io_err(&path))?;
                }
                Ok(())
            });
        }

        if let Some(dir) = temp_output_dir.filter(|d| *d != table_work_dir) {
            report.run(CleanupStep::RemoveTempOutputDir, || {
                remove_dir_if_empty(&dir).map(|_| ())
            });
        }

        report.run(CleanupStep::DeleteDescriptor, || {
            DescriptorLocation::for_table(config, db_table).delete().map(|_| ())
        });

        report.run(CleanupStep::RemoveTableWorkDir, || {
            remove_dir_if_empty(&table_work_dir).map(|_| ())
        });

        if let Some(staging) = paths::query_staging_dir(config) {
            report.run(CleanupStep::RemoveQueryStagingDir, || {
                remove_dir_if_empty(&staging).map(|_| ())
            });
        }

        debug!(
            query_id = config.query_id(),
            table = db_table,
            failed = report.failed.len(),
            "cleanup de tabla terminado"
        );
        report
    }

    /// Limpieza del query completo: side file y work dir (si quedó vacío).
    pub fn clean_up_query(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let config = &self.config;

        report.run(CleanupStep::DeleteSideFile, || {
            SparkJobFile::delete(config).map(|_| ())
        });
        report.run(CleanupStep::RemoveQueryWorkDir, || {
            remove_dir_if_empty(&paths::query_work_dir(config)).map(|_| ())
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteStrategy;
    use crate::schema::{FieldSchema, FieldType, TableId, TableSchema};
    use crate::warehouse::LocalWarehouse;
    use tempfile::TempDir;

    #[test]
    fn safe_clean_up_traga_errores() {
        assert!(safe_clean_up("ok", || Ok(())));
        assert!(!safe_clean_up("falla", || Err(ConnectorError::warehouse("boom"))));
    }

    #[test]
    fn remove_dir_if_empty_respeta_directorios_con_contenido() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("x");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("f"), "").unwrap();
        assert!(!remove_dir_if_empty(&sub).unwrap());
        fs::remove_file(sub.join("f")).unwrap();
        assert!(remove_dir_if_empty(&sub).unwrap());
        assert!(!remove_dir_if_empty(&sub).unwrap());
    }

    #[test]
    fn limpieza_de_tabla_borra_descriptor_artefactos_y_directorios() {
        let work = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let config = Arc::new(
            JobConfig::builder("q1")
                .work_dir_parent(work.path())
                .staging_root(staging.path())
                .write_strategy(WriteStrategy::Staged)
                .build(),
        );
        let warehouse: Arc<dyn WarehouseClient> = Arc::new(LocalWarehouse::new(root.path()));
        let desc = JobDescriptor::create(
            &config,
            "db.t",
            TableId::new("p", "d", "t"),
            TableSchema::new(vec![FieldSchema::new("n", FieldType::Integer)]),
            WriteStrategy::Staged,
            false,
        )
        .unwrap();
        let loc = DescriptorLocation::for_table(&config, "db.t");
        loc.persist(&desc).unwrap();
        fs::write(desc.temp_output_dir().join("p_d_t_a1_0.jsonl"), "").unwrap();
        fs::write(desc.temp_output_dir().join("_inprogress.p_d_t_a2_0.jsonl"), "").unwrap();

        let cleanup = CleanupCoordinator::new(config.clone(), warehouse);
        let report = cleanup.clean_up_table("db.t", Some(&desc), false);
        assert!(report.is_clean(), "{report:?}");
        assert!(!report.attempted.contains(&CleanupStep::DeleteScratchTable));
        assert!(!loc.exists());
        assert!(!desc.temp_output_dir().exists());
        assert!(!paths::query_staging_dir(&config).unwrap().exists());

        let report = cleanup.clean_up_query();
        assert!(report.is_clean());
        assert!(!paths::query_work_dir(&config).exists());
    }
}
