//! Side file del engine SQL externo: durante el planning se anotan las tablas
//! de salida (append u overwrite) y el commit lo lee para decidir, por tabla,
//! si hay que truncar antes de cargar.

use serde::{Deserialize, Serialize};
use std::fs;

use crate::config::JobConfig;
use crate::error::{io_err, ConnectorError, Result};
use crate::paths;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkJobFile {
    #[serde(default)]
    pub insert_tables: Vec<String>,
    #[serde(default)]
    pub overwrite_tables: Vec<String>,
}

impl SparkJobFile {
    pub fn add_table(&mut self, db_table: &str, overwrite: bool) {
        let list = if overwrite {
            &mut self.overwrite_tables
        } else {
            &mut self.insert_tables
        };
        if !list.iter().any(|t| t == db_table) {
            list.push(db_table.to_string());
        }
    }

    pub fn is_overwrite(&self, db_table: &str) -> bool {
        self.overwrite_tables.iter().any(|t| t == db_table)
    }

    /// Todas las tablas de salida, sin repetir.
    pub fn tables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for t in self.insert_tables.iter().chain(&self.overwrite_tables) {
            if !out.contains(t) {
                out.push(t.clone());
            }
        }
        out
    }

    pub fn write(&self, config: &JobConfig) -> Result<()> {
        let path = paths::side_file_path(config);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        let tmp = paths::in_progress_path(&path);
        fs::write(&tmp, serde_json::to_vec_pretty(self)?).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))
    }

    /// Si falta el archivo, casi siempre es que la extensión SQL no está
    /// configurada: el error lo dice.
    pub fn read(config: &JobConfig) -> Result<Self> {
        let path = paths::side_file_path(config);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConnectorError::configuration(format!(
                    "job file {} not found; make sure the `spark.sql.extensions` property \
                     includes the warehouse bridge extension so output tables are recorded \
                     during planning",
                    path.display()
                )))
            }
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    pub fn read_or_default(config: &JobConfig) -> Result<Self> {
        match Self::read(config) {
            Err(ConnectorError::Configuration { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    /// `Ok(false)` si no existía.
    pub fn delete(config: &JobConfig) -> Result<bool> {
        let path = paths::side_file_path(config);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}
