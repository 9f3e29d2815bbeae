//! Warehouse sobre el filesystem local.
//!
//! Cada tabla es un directorio con un `manifest.json` que enumera sus archivos
//! de datos. Toda mutación escribe un manifest nuevo y lo publica con un
//! rename, así un lector concurrente ve la tabla vieja o la nueva, nunca una
//! mezcla.
//!
//! ```text
//! {root}/{project}/{dataset}/{table}/
//!     manifest.json
//!     data/*.jsonl          <- filas visibles (una fila JSON por línea)
//!     streams/{name}.jsonl  <- filas pendientes de streams sin finalizar
//! ```

use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    LoadOptions, LoadResult, StreamRef, TableInfo, TableStatistics, WarehouseClient,
};
use crate::error::{io_err, ConnectorError, Result};
use crate::schema::{Partitioning, TableId, TableSchema};
use crate::staged::read_staged_file;
use crate::value::WarehouseRow;

const MANIFEST_FILE: &str = "manifest.json";
const DATA_DIR: &str = "data";
const STREAMS_DIR: &str = "streams";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    schema: TableSchema,
    #[serde(default)]
    partitioning: Option<Partitioning>,
    /// Rutas relativas al directorio de la tabla.
    files: Vec<String>,
    #[serde(default)]
    committed_streams: Vec<String>,
    num_rows: u64,
    version: u64,
}

pub struct LocalWarehouse {
    root: PathBuf,
    // serializa mutaciones dentro del proceso
    write_lock: Mutex<()>,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, id: &TableId) -> PathBuf {
        self.root.join(&id.project).join(&id.dataset).join(&id.table)
    }

    fn stream_path(&self, id: &TableId, stream: &StreamRef) -> PathBuf {
        self.table_dir(id)
            .join(STREAMS_DIR)
            .join(format!("{}.jsonl", stream.name))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| ConnectorError::illegal_state("local warehouse lock poisoned"))
    }

    fn read_manifest(&self, id: &TableId) -> Result<Option<Manifest>> {
        let path = self.table_dir(id).join(MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    fn require_manifest(&self, id: &TableId) -> Result<Manifest> {
        self.read_manifest(id)?
            .ok_or_else(|| ConnectorError::warehouse(format!("table {id} not found")))
    }

    /// Publica un manifest nuevo: archivo temporal + rename.
    fn publish_manifest(&self, id: &TableId, manifest: &Manifest) -> Result<()> {
        let dir = self.table_dir(id);
        let tmp = dir.join(format!(".manifest-{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec_pretty(manifest)?).map_err(io_err(&tmp))?;
        let target = dir.join(MANIFEST_FILE);
        fs::rename(&tmp, &target).map_err(io_err(&target))?;
        debug!(table = %id, version = manifest.version, rows = manifest.num_rows, "manifest publicado");
        Ok(())
    }

    /// Escribe filas a un archivo nuevo en `data/` y devuelve su ruta relativa.
    fn write_data_file(&self, id: &TableId, tag: &str, rows: &[WarehouseRow]) -> Result<String> {
        let data_dir = self.table_dir(id).join(DATA_DIR);
        fs::create_dir_all(&data_dir).map_err(io_err(&data_dir))?;
        let name = format!("{tag}-{}.jsonl", Uuid::new_v4());
        let path = data_dir.join(&name);
        let file = fs::File::create(&path).map_err(io_err(&path))?;
        let mut out = BufWriter::new(file);
        for row in rows {
            serde_json::to_writer(&mut out, row)?;
            out.write_all(b"\n").map_err(io_err(&path))?;
        }
        out.flush().map_err(io_err(&path))?;
        Ok(format!("{DATA_DIR}/{name}"))
    }

    fn read_rows_file(path: &Path) -> Result<Vec<WarehouseRow>> {
        let file = fs::File::open(path).map_err(io_err(path))?;
        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_err(path))?;
            if !line.trim().is_empty() {
                rows.push(serde_json::from_str(&line)?);
            }
        }
        Ok(rows)
    }

    fn count_rows(path: &Path) -> Result<u64> {
        let file = fs::File::open(path).map_err(io_err(path))?;
        let mut n = 0;
        for line in BufReader::new(file).lines() {
            if !line.map_err(io_err(path))?.trim().is_empty() {
                n += 1;
            }
        }
        Ok(n)
    }

    fn info(id: &TableId, m: &Manifest) -> TableInfo {
        TableInfo {
            id: id.clone(),
            schema: m.schema.clone(),
            partitioning: m.partitioning.clone(),
            num_rows: m.num_rows,
        }
    }
}

impl WarehouseClient for LocalWarehouse {
    fn get_table(&self, id: &TableId) -> Result<Option<TableInfo>> {
        Ok(self.read_manifest(id)?.map(|m| Self::info(id, &m)))
    }

    fn create_table(
        &self,
        id: &TableId,
        schema: &TableSchema,
        partitioning: Option<&Partitioning>,
    ) -> Result<TableInfo> {
        let _guard = self.lock()?;
        if self.read_manifest(id)?.is_some() {
            return Err(ConnectorError::warehouse(format!("table {id} already exists")));
        }
        let dir = self.table_dir(id);
        for sub in [DATA_DIR, STREAMS_DIR] {
            let p = dir.join(sub);
            fs::create_dir_all(&p).map_err(io_err(&p))?;
        }
        let manifest = Manifest {
            schema: schema.clone(),
            partitioning: partitioning.cloned(),
            files: Vec::new(),
            committed_streams: Vec::new(),
            num_rows: 0,
            version: 1,
        };
        self.publish_manifest(id, &manifest)?;
        info!(table = %id, "tabla creada");
        Ok(Self::info(id, &manifest))
    }

    fn delete_table(&self, id: &TableId) -> Result<bool> {
        let _guard = self.lock()?;
        let dir = self.table_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(table = %id, "tabla borrada");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }

    fn load_from_files(
        &self,
        id: &TableId,
        files: &[PathBuf],
        options: LoadOptions,
    ) -> Result<LoadResult> {
        if files.is_empty() {
            return Err(ConnectorError::warehouse(format!(
                "load into {id} requested with no source files"
            )));
        }
        let _guard = self.lock()?;
        let mut manifest = self.require_manifest(id)?;

        let mut rows = Vec::new();
        for f in files {
            let (header, file_rows) = read_staged_file(f)?;
            if header.schema.len() != manifest.schema.len() {
                return Err(ConnectorError::warehouse(format!(
                    "file {} has {} fields, table {id} has {}",
                    f.display(),
                    header.schema.len(),
                    manifest.schema.len()
                )));
            }
            rows.extend(file_rows);
        }

        let rows_loaded = rows.len() as u64;
        let data_file = self.write_data_file(id, "load", &rows)?;
        if options.overwrite {
            manifest.files = vec![data_file];
            manifest.num_rows = rows_loaded;
        } else {
            manifest.files.push(data_file);
            manifest.num_rows += rows_loaded;
        }
        manifest.version += 1;
        self.publish_manifest(id, &manifest)?;

        if options.delete_source_files {
            for f in files {
                if let Err(e) = fs::remove_file(f) {
                    warn!(file = %f.display(), error = %e, "no se pudo borrar archivo fuente de la carga");
                }
            }
        }

        info!(table = %id, rows = rows_loaded, files = files.len(), overwrite = options.overwrite, "carga completada");
        Ok(LoadResult { rows_loaded })
    }

    fn create_write_stream(&self, id: &TableId) -> Result<StreamRef> {
        let _guard = self.lock()?;
        self.require_manifest(id)?;
        let stream = StreamRef::new(format!("stream-{}", Uuid::new_v4()));
        let path = self.stream_path(id, &stream);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        fs::File::create(&path).map_err(io_err(&path))?;
        debug!(table = %id, stream = %stream.name, "stream creado");
        Ok(stream)
    }

    fn stream_insert(&self, id: &TableId, stream: &StreamRef, rows: &[WarehouseRow]) -> Result<u64> {
        let path = self.stream_path(id, stream);
        let file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|_| {
                ConnectorError::warehouse(format!("stream {} on {id} does not exist", stream.name))
            })?;
        let mut out = BufWriter::new(file);
        for row in rows {
            serde_json::to_writer(&mut out, row)?;
            out.write_all(b"\n").map_err(io_err(&path))?;
        }
        out.flush().map_err(io_err(&path))?;
        Ok(rows.len() as u64)
    }

    fn finalize(&self, id: &TableId, streams: &[StreamRef], truncate: bool) -> Result<u64> {
        let _guard = self.lock()?;
        let mut manifest = self.require_manifest(id)?;

        let mut new_files = Vec::new();
        let mut new_rows = 0;
        for s in streams {
            if manifest.committed_streams.contains(&s.name) {
                debug!(table = %id, stream = %s.name, "stream ya commiteado, se ignora");
                continue;
            }
            let path = self.stream_path(id, s);
            if !path.is_file() {
                return Err(ConnectorError::warehouse(format!(
                    "stream {} on {id} does not exist or was discarded",
                    s.name
                )));
            }
            new_rows += Self::count_rows(&path)?;
            new_files.push((s.name.clone(), format!("{STREAMS_DIR}/{}.jsonl", s.name)));
        }

        if new_files.is_empty() {
            return Ok(0);
        }

        if truncate {
            manifest.files.clear();
            manifest.num_rows = 0;
        }
        for (name, file) in new_files {
            manifest.committed_streams.push(name);
            manifest.files.push(file);
        }
        manifest.num_rows += new_rows;
        manifest.version += 1;
        self.publish_manifest(id, &manifest)?;

        info!(table = %id, rows = new_rows, streams = streams.len(), truncate, "streams finalizados");
        Ok(new_rows)
    }

    fn discard(&self, id: &TableId, stream: &StreamRef) -> Result<()> {
        let _guard = self.lock()?;
        if let Some(m) = self.read_manifest(id)? {
            if m.committed_streams.contains(&stream.name) {
                return Err(ConnectorError::warehouse(format!(
                    "stream {} on {id} is already committed",
                    stream.name
                )));
            }
        }
        let path = self.stream_path(id, stream);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(table = %id, stream = %stream.name, "stream descartado");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    fn replace_table(&self, target: &TableId, source: &TableId) -> Result<()> {
        let _guard = self.lock()?;
        let src = self.require_manifest(source)?;
        let mut dst = self.require_manifest(target)?;

        let src_dir = self.table_dir(source);
        let data_dir = self.table_dir(target).join(DATA_DIR);
        fs::create_dir_all(&data_dir).map_err(io_err(&data_dir))?;

        let mut files = Vec::with_capacity(src.files.len());
        for f in &src.files {
            let name = format!("replace-{}.jsonl", Uuid::new_v4());
            let to = data_dir.join(&name);
            let from = src_dir.join(f);
            fs::copy(&from, &to).map_err(io_err(&from))?;
            files.push(format!("{DATA_DIR}/{name}"));
        }

        dst.files = files;
        dst.num_rows = src.num_rows;
        dst.version += 1;
        self.publish_manifest(target, &dst)?;
        info!(target = %target, source = %source, rows = dst.num_rows, "tabla reemplazada");
        Ok(())
    }

    fn list_table_basic_statistics(&self, id: &TableId) -> Result<TableStatistics> {
        let m = self.require_manifest(id)?;
        let dir = self.table_dir(id);
        let mut total_size = 0;
        for f in &m.files {
            let p = dir.join(f);
            total_size += fs::metadata(&p).map_err(io_err(&p))?.len();
        }
        Ok(TableStatistics {
            num_rows: m.num_rows,
            total_size,
            num_files: m.files.len() as u64,
        })
    }

    fn read_rows(&self, id: &TableId) -> Result<Vec<WarehouseRow>> {
        let m = self.require_manifest(id)?;
        let dir = self.table_dir(id);
        let mut rows = Vec::new();
        for f in &m.files {
            rows.extend(Self::read_rows_file(&dir.join(f))?);
        }
        Ok(rows)
    }
}
