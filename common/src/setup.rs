//! Setup del output job (apertura de la tabla en el planning): toma el
//! schema snapshot del warehouse, crea y persiste el job descriptor. Tiene
//! que terminar antes de que arranque cualquier tarea.

use tracing::info;

use crate::config::{ExecutionEngine, JobConfig};
use crate::descriptor::{DescriptorLocation, JobDescriptor};
use crate::error::{ConnectorError, Result};
use crate::schema::{Partitioning, TableId, TableSchema};
use crate::side_file::SparkJobFile;
use crate::warehouse::WarehouseClient;

/// Cómo crear la tabla si todavía no existe.
#[derive(Debug, Clone, Copy)]
pub struct CreateTable<'a> {
    pub schema: &'a TableSchema,
    pub partitioning: Option<&'a Partitioning>,
}

pub fn prepare_output_table(
    config: &JobConfig,
    warehouse: &dyn WarehouseClient,
    db_table: &str,
    table_id: &TableId,
    overwrite: bool,
    create: Option<CreateTable<'_>>,
) -> Result<JobDescriptor> {
    if !config.output_job() {
        return Err(ConnectorError::configuration(format!(
            "query {} is not an output job",
            config.query_id()
        )));
    }

    let table = match (warehouse.get_table(table_id)?, create) {
        (Some(t), _) => t,
        (None, Some(c)) => warehouse.create_table(table_id, c.schema, c.partitioning)?,
        (None, None) => {
            return Err(ConnectorError::configuration(format!(
                "table {table_id} does not exist"
            )))
        }
    };

    // el schema se fija acá y no se vuelve a pedir durante el job
    let descriptor = JobDescriptor::create(
        config,
        db_table,
        table_id.clone(),
        table.schema,
        config.write_strategy(),
        overwrite,
    )?;
    DescriptorLocation::for_table(config, db_table).persist(&descriptor)?;

    if config.engine() == ExecutionEngine::SparkSql {
        let mut side = SparkJobFile::read_or_default(config)?;
        side.add_table(db_table, overwrite);
        side.write(config)?;
    }

    info!(
        query_id = config.query_id(),
        table = %table_id,
        db_table,
        strategy = %config.write_strategy(),
        overwrite,
        "output job preparado"
    );
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteStrategy;
    use crate::schema::{FieldSchema, FieldType};
    use crate::warehouse::LocalWarehouse;
    use tempfile::TempDir;

    fn schema() -> TableSchema {
        TableSchema::new(vec![FieldSchema::new("n", FieldType::Integer)])
    }

    #[test]
    fn tabla_inexistente_sin_schema_es_error_de_configuracion() {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let cfg = JobConfig::builder("q").work_dir_parent(work.path()).build();
        let wh = LocalWarehouse::new(root.path());
        let err = prepare_output_table(&cfg, &wh, "db.t", &TableId::new("p", "d", "t"), false, None)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration { .. }));
    }

    #[test]
    fn crea_la_tabla_y_persiste_el_descriptor() {
        let work = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let cfg = JobConfig::builder("q")
            .work_dir_parent(work.path())
            .staging_root(staging.path())
            .write_strategy(WriteStrategy::Staged)
            .engine(ExecutionEngine::SparkSql)
            .build();
        let wh = LocalWarehouse::new(root.path());
        let id = TableId::new("p", "d", "t");
        let s = schema();
        let desc = prepare_output_table(
            &cfg,
            &wh,
            "db.t",
            &id,
            true,
            Some(CreateTable { schema: &s, partitioning: None }),
        )
        .unwrap();

        assert!(wh.get_table(&id).unwrap().is_some());
        assert_eq!(DescriptorLocation::for_table(&cfg, "db.t").load().unwrap(), desc);
        assert!(SparkJobFile::read(&cfg).unwrap().is_overwrite("db.t"));
    }

    #[test]
    fn query_sin_salida_no_prepara_nada() {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let cfg = JobConfig::builder("q")
            .work_dir_parent(work.path())
            .output_job(false)
            .build();
        let wh = LocalWarehouse::new(root.path());
        assert!(prepare_output_table(&cfg, &wh, "db.t", &TableId::new("p", "d", "t"), false, None).is_err());
        assert!(!DescriptorLocation::for_table(&cfg, "db.t").exists());
    }
}
