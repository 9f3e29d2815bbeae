//! Superficie del cliente del warehouse que consume el protocolo de commit.
//!
//! El cliente real (wire/RPC) queda afuera; acá vive el trait y una
//! implementación sobre el filesystem con las mismas garantías de atomicidad.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::schema::{Partitioning, TableId, TableSchema};
use crate::value::WarehouseRow;

pub mod local;

pub use local::LocalWarehouse;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub schema: TableSchema,
    pub partitioning: Option<Partitioning>,
    pub num_rows: u64,
}

/// Stream de escritura pendiente (camino directo).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    pub name: String,
}

impl StreamRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Reemplaza el contenido de la tabla en vez de agregar.
    pub overwrite: bool,
    /// Borra los archivos fuente cuando la carga terminó.
    pub delete_source_files: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadResult {
    pub rows_loaded: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatistics {
    pub num_rows: u64,
    pub total_size: u64,
    pub num_files: u64,
}

pub trait WarehouseClient: Send + Sync {
    /// `Ok(None)` si la tabla no existe.
    fn get_table(&self, id: &TableId) -> Result<Option<TableInfo>>;

    fn create_table(
        &self,
        id: &TableId,
        schema: &TableSchema,
        partitioning: Option<&Partitioning>,
    ) -> Result<TableInfo>;

    /// `Ok(false)` si no existía.
    fn delete_table(&self, id: &TableId) -> Result<bool>;

    /// Carga masiva atómica desde archivos staged.
    fn load_from_files(
        &self,
        id: &TableId,
        files: &[PathBuf],
        options: LoadOptions,
    ) -> Result<LoadResult>;

    fn create_write_stream(&self, id: &TableId) -> Result<StreamRef>;

    /// Agrega filas pendientes (invisibles hasta el finalize).
    fn stream_insert(&self, id: &TableId, stream: &StreamRef, rows: &[WarehouseRow]) -> Result<u64>;

    /// Hace visibles, de una sola vez, las filas de todos los streams.
    /// Los streams ya commiteados se ignoran. Con `truncate` el contenido
    /// previo de la tabla se descarta en el mismo paso.
    fn finalize(&self, id: &TableId, streams: &[StreamRef], truncate: bool) -> Result<u64>;

    fn discard(&self, id: &TableId, stream: &StreamRef) -> Result<()>;

    /// Reemplaza atómicamente el contenido de `target` por el de `source`.
    fn replace_table(&self, target: &TableId, source: &TableId) -> Result<()>;

    fn list_table_basic_statistics(&self, id: &TableId) -> Result<TableStatistics>;

    fn read_rows(&self, id: &TableId) -> Result<Vec<WarehouseRow>>;
}
