//! Formato de los artefactos que las tareas dejan en disco:
//!
//! - archivos staged: JSON lines, un header autodescriptivo y luego una fila
//!   (array de `WarehouseValue`) por línea;
//! - archivos de referencia a streams (camino directo): un JSON chico que
//!   nombra el stream pendiente.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use crate::error::{io_err, ConnectorError, Result};
use crate::paths::{IN_PROGRESS_PREFIX, STAGED_SUFFIX, STREAM_REF_SUFFIX};
use crate::schema::{FieldSchema, TableId};
use crate::value::WarehouseRow;

pub const STAGED_FORMAT: &str = "whbridge-staged-v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedHeader {
    pub format: String,
    pub table: TableId,
    pub schema: Vec<FieldSchema>,
}

impl StagedHeader {
    pub fn new(table: TableId, schema: Vec<FieldSchema>) -> Self {
        Self {
            format: STAGED_FORMAT.to_string(),
            table,
            schema,
        }
    }
}

/// `path` es el archivo detrás de `out`, para los errores de I/O.
pub fn write_header<W: Write>(out: &mut W, path: &Path, header: &StagedHeader) -> Result<()> {
    write_line(out, path, header)
}

pub fn write_row<W: Write>(out: &mut W, path: &Path, row: &WarehouseRow) -> Result<()> {
    write_line(out, path, row)
}

fn write_line<W: Write, T: Serialize + ?Sized>(out: &mut W, path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    out.write_all(&line).map_err(io_err(path))
}

/// Lee un archivo staged completo (header + filas).
pub fn read_staged_file(path: &Path) -> Result<(StagedHeader, Vec<WarehouseRow>)> {
    let file = fs::File::open(path).map_err(io_err(path))?;
    let mut lines = BufReader::new(file).lines();

    let first = lines
        .next()
        .transpose()
        .map_err(io_err(path))?
        .ok_or_else(|| {
            ConnectorError::encoding(format!("staged file {} is empty", path.display()))
        })?;
    let header: StagedHeader = serde_json::from_str(&first)?;
    if header.format != STAGED_FORMAT {
        return Err(ConnectorError::encoding(format!(
            "staged file {} has unknown format `{}`",
            path.display(),
            header.format
        )));
    }

    let mut rows = Vec::new();
    for line in lines {
        let line = line.map_err(io_err(path))?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok((header, rows))
}

/* =========================
   Referencias a streams
   ========================= */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRefFile {
    pub table_id: TableId,
    pub stream: String,
    pub task_attempt_id: String,
    pub writer_id: u32,
    pub row_count: u64,
}

impl StreamRefFile {
    /// Escritura atómica: nombre oculto + rename.
    pub fn write(&self, path: &Path) -> Result<()> {
        let tmp = crate::paths::in_progress_path(path);
        fs::write(&tmp, serde_json::to_vec(self)?).map_err(io_err(&tmp))?;
        fs::rename(&tmp, path).map_err(io_err(path))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(io_err(path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/* =========================
   Listados
   ========================= */

fn file_names(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        // una tabla sin tareas que hayan escrito no tiene directorio
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            out.push((name.to_string(), path.clone()));
        }
    }
    out.sort();
    Ok(out)
}

fn list_committed(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>> {
    let dotted = format!(".{suffix}");
    Ok(file_names(dir)?
        .into_iter()
        .filter(|(name, _)| name.starts_with(prefix) && name.ends_with(&dotted))
        .map(|(_, path)| path)
        .collect())
}

/// Archivos staged terminados (no los que están en escritura).
pub fn list_staged_artifacts(dir: &Path, table_prefix: &str) -> Result<Vec<PathBuf>> {
    list_committed(dir, table_prefix, STAGED_SUFFIX)
}

pub fn list_stream_refs(dir: &Path, table_prefix: &str) -> Result<Vec<(PathBuf, StreamRefFile)>> {
    list_committed(dir, table_prefix, STREAM_REF_SUFFIX)?
        .into_iter()
        .map(|p| StreamRefFile::read(&p).map(|r| (p, r)))
        .collect()
}

/// Todo lo que empiece con `prefix`, terminado o en escritura.
pub fn list_all_with_prefix(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let hidden = format!("{IN_PROGRESS_PREFIX}{prefix}");
    Ok(file_names(dir)?
        .into_iter()
        .filter(|(name, _)| name.starts_with(prefix) || name.starts_with(&hidden))
        .map(|(_, path)| path)
        .collect())
}
