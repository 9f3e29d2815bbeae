//! Job descriptor: el registro persistido que describe un job de escritura
//! para una tabla. Lo crea el setup, lo leen las tareas (en otros procesos) y
//! la fase de commit, y lo borra el cleanup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::debug;
use uuid::Uuid;

use crate::config::{JobConfig, WriteStrategy};
use crate::error::{io_err, ConnectorError, Result};
use crate::paths;
use crate::schema::{TableId, TableSchema};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    query_id: String,
    db_table_name: String,
    table_id: TableId,
    write_strategy: WriteStrategy,
    schema: TableSchema,
    temp_output_dir: PathBuf,
    overwrite: bool,
    /// Schema de filas serializado, sólo para staged (archivos autodescriptivos).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    row_schema: Option<String>,
    created_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Arma el descriptor. Para `staged` exige staging root configurado y con
    /// permisos de escritura (se prueba escribiendo un archivo).
    pub fn create(
        config: &JobConfig,
        db_table_name: &str,
        table_id: TableId,
        schema: TableSchema,
        write_strategy: WriteStrategy,
        overwrite: bool,
    ) -> Result<Self> {
        let temp_output_dir = paths::job_temp_output_dir(config, db_table_name, write_strategy)?;

        let row_schema = match write_strategy {
            WriteStrategy::Staged => {
                check_writable(&temp_output_dir)?;
                Some(serde_json::to_string(&schema.fields)?)
            }
            WriteStrategy::Direct => None,
        };

        Ok(Self {
            query_id: config.query_id().to_string(),
            db_table_name: db_table_name.to_string(),
            table_id,
            write_strategy,
            schema,
            temp_output_dir,
            overwrite,
            row_schema,
            created_at: Utc::now(),
        })
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn db_table_name(&self) -> &str {
        &self.db_table_name
    }

    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    pub fn write_strategy(&self) -> WriteStrategy {
        self.write_strategy
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn temp_output_dir(&self) -> &Path {
        &self.temp_output_dir
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn row_schema(&self) -> Option<&str> {
        self.row_schema.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

fn check_writable(dir: &Path) -> Result<()> {
    let not_writable = |e: std::io::Error| {
        ConnectorError::configuration(format!(
            "staging directory {} is not writable: {e}",
            dir.display()
        ))
    };
    fs::create_dir_all(dir).map_err(not_writable)?;
    let probe = dir.join(format!(".probe-{}", Uuid::new_v4()));
    fs::write(&probe, b"").map_err(not_writable)?;
    fs::remove_file(&probe).map_err(not_writable)?;
    Ok(())
}

/* =========================
   Ubicación y persistencia
   ========================= */

/// Handle explícito al estado externo de un descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorLocation {
    path: PathBuf,
}

impl DescriptorLocation {
    pub fn for_table(config: &JobConfig, db_table_name: &str) -> Self {
        Self {
            path: paths::descriptor_path(config, db_table_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Escribe a un archivo temporal hermano y renombra: un lector nunca ve
    /// un descriptor a medio escribir.
    pub fn persist(&self, descriptor: &JobDescriptor) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| ConnectorError::illegal_state("descriptor path has no parent"))?;
        fs::create_dir_all(dir).map_err(io_err(dir))?;

        let tmp = dir.join(format!(".job-details-{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(descriptor)?;
        {
            let mut f = fs::File::create(&tmp).map_err(io_err(&tmp))?;
            f.write_all(&bytes).map_err(io_err(&tmp))?;
            f.sync_all().map_err(io_err(&tmp))?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;

        debug!(
            path = %self.path.display(),
            table = %descriptor.table_id(),
            "job descriptor persistido"
        );
        Ok(())
    }

    /// Nunca devuelve un default: si no está, es `MissingJobState`.
    pub fn load(&self) -> Result<JobDescriptor> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConnectorError::MissingJobState {
                    path: self.path.clone(),
                })
            }
            Err(e) => return Err(io_err(&self.path)(e)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Borra el archivo; `Ok(false)` si ya no existía.
    pub fn delete(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&self.path)(e)),
        }
    }
}
