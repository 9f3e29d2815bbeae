//! Task writer: recibe las filas de un intento de tarea, las convierte a
//! valores del warehouse y las materializa según la estrategia del job.
//!
//! Estados: `Open -> Writing -> {Closed | Failed}`. Un writer que falla (o que
//! se descarta sin cerrar) libera su artefacto: el job nunca referencia un
//! archivo a medio escribir.

use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::config::WriteStrategy;
use crate::convert::to_warehouse_row;
use crate::descriptor::JobDescriptor;
use crate::error::{io_err, ConnectorError, Result};
use crate::paths::{self, STAGED_SUFFIX, STREAM_REF_SUFFIX};
use crate::staged::{self, StagedHeader, StreamRefFile};
use crate::task::{OutputArtifact, TaskOutputRecord};
use crate::value::{Row, WarehouseRow};
use crate::warehouse::{StreamRef, WarehouseClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Open,
    Writing,
    Closed,
    Failed,
}

enum Sink {
    Direct {
        stream: StreamRef,
        buffer: Vec<WarehouseRow>,
        ref_path: PathBuf,
    },
    Staged {
        out: BufWriter<fs::File>,
        tmp_path: PathBuf,
        final_path: PathBuf,
    },
}

pub struct TaskWriter<'a> {
    descriptor: &'a JobDescriptor,
    warehouse: &'a dyn WarehouseClient,
    task_attempt_id: String,
    writer_id: u32,
    batch_rows: usize,
    state: WriterState,
    sink: Option<Sink>,
    row_count: u64,
}

impl<'a> TaskWriter<'a> {
    /// Reserva el artefacto del intento: un stream del warehouse (direct) o
    /// un archivo oculto en el directorio de staging (staged).
    pub fn open(
        descriptor: &'a JobDescriptor,
        warehouse: &'a dyn WarehouseClient,
        task_attempt_id: &str,
        writer_id: u32,
        batch_rows: usize,
    ) -> Result<Self> {
        let dir = descriptor.temp_output_dir();
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let table_id = descriptor.table_id();

        let sink = match descriptor.write_strategy() {
            WriteStrategy::Direct => {
                let stream = warehouse.create_write_stream(table_id)?;
                let ref_path = paths::task_artifact_path(
                    dir,
                    table_id,
                    task_attempt_id,
                    writer_id,
                    STREAM_REF_SUFFIX,
                );
                Sink::Direct {
                    stream,
                    buffer: Vec::new(),
                    ref_path,
                }
            }
            WriteStrategy::Staged => {
                let final_path =
                    paths::task_artifact_path(dir, table_id, task_attempt_id, writer_id, STAGED_SUFFIX);
                let tmp_path = paths::in_progress_path(&final_path);
                let file = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
                let mut out = BufWriter::new(file);
                let header = StagedHeader::new(table_id.clone(), descriptor.schema().fields.clone());
                if let Err(e) = staged::write_header(&mut out, &tmp_path, &header) {
                    drop(out);
                    remove_if_exists(&tmp_path);
                    return Err(e);
                }
                Sink::Staged {
                    out,
                    tmp_path,
                    final_path,
                }
            }
        };

        debug!(
            table = %table_id,
            attempt = task_attempt_id,
            writer = writer_id,
            strategy = %descriptor.write_strategy(),
            "task writer abierto"
        );

        Ok(Self {
            descriptor,
            warehouse,
            task_attempt_id: task_attempt_id.to_string(),
            writer_id,
            batch_rows: batch_rows.max(1),
            state: WriterState::Open,
            sink: Some(sink),
            row_count: 0,
        })
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            WriterState::Open | WriterState::Writing => Ok(()),
            other => Err(ConnectorError::illegal_state(format!(
                "task writer {} is {other:?}",
                self.task_attempt_id
            ))),
        }
    }

    /// Convierte y escribe una fila. Cualquier error deja el writer en
    /// `Failed` con el artefacto liberado.
    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        self.ensure_active()?;
        let result = self.try_write_row(row);
        match result {
            Ok(()) => {
                self.state = WriterState::Writing;
                self.row_count += 1;
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn try_write_row(&mut self, row: &Row) -> Result<()> {
        let wrow = to_warehouse_row(row, self.descriptor.schema(), self.descriptor.write_strategy())?;
        let table_id = self.descriptor.table_id();
        let batch_rows = self.batch_rows;
        match self.sink.as_mut() {
            Some(Sink::Direct { stream, buffer, .. }) => {
                buffer.push(wrow);
                if buffer.len() >= batch_rows {
                    self.warehouse.stream_insert(table_id, stream, buffer)?;
                    buffer.clear();
                }
                Ok(())
            }
            Some(Sink::Staged { out, tmp_path, .. }) => staged::write_row(out, tmp_path, &wrow),
            None => Err(ConnectorError::illegal_state("task writer has no sink")),
        }
    }

    /// Cierra el writer y publica el artefacto.
    pub fn close(mut self) -> Result<TaskOutputRecord> {
        self.ensure_active()?;
        match self.try_close() {
            Ok(artifact) => {
                self.state = WriterState::Closed;
                debug!(
                    table = %self.descriptor.table_id(),
                    attempt = %self.task_attempt_id,
                    rows = self.row_count,
                    "task writer cerrado"
                );
                Ok(TaskOutputRecord {
                    db_table: self.descriptor.db_table_name().to_string(),
                    task_attempt_id: self.task_attempt_id.clone(),
                    writer_id: self.writer_id,
                    artifact,
                    row_count: self.row_count,
                })
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn try_close(&mut self) -> Result<OutputArtifact> {
        let table_id = self.descriptor.table_id();
        match self.sink.as_mut() {
            Some(Sink::Direct {
                stream,
                buffer,
                ref_path,
            }) => {
                if !buffer.is_empty() {
                    self.warehouse.stream_insert(table_id, stream, buffer)?;
                    buffer.clear();
                }
                StreamRefFile {
                    table_id: table_id.clone(),
                    stream: stream.name.clone(),
                    task_attempt_id: self.task_attempt_id.clone(),
                    writer_id: self.writer_id,
                    row_count: self.row_count,
                }
                .write(ref_path)?;
                Ok(OutputArtifact::Stream {
                    stream: stream.name.clone(),
                    ref_path: ref_path.clone(),
                })
            }
            Some(Sink::Staged {
                out,
                tmp_path,
                final_path,
            }) => {
                out.flush().map_err(io_err(tmp_path))?;
                out.get_ref().sync_all().map_err(io_err(tmp_path))?;
                fs::rename(&*tmp_path, &*final_path).map_err(io_err(final_path))?;
                Ok(OutputArtifact::StagedFile {
                    path: final_path.clone(),
                })
            }
            None => Err(ConnectorError::illegal_state("task writer has no sink")),
        }
    }

    /// Descarta lo escrito por este intento.
    pub fn abort(mut self) {
        if matches!(self.state, WriterState::Open | WriterState::Writing) {
            self.release();
            self.state = WriterState::Failed;
        }
    }

    fn fail(&mut self, cause: &ConnectorError) {
        warn!(
            table = %self.descriptor.table_id(),
            attempt = %self.task_attempt_id,
            error = %cause,
            "task writer falló, se libera el artefacto"
        );
        self.release();
        self.state = WriterState::Failed;
    }

    fn release(&mut self) {
        match self.sink.take() {
            Some(Sink::Direct {
                stream, ref_path, ..
            }) => {
                if let Err(e) = self.warehouse.discard(self.descriptor.table_id(), &stream) {
                    warn!(stream = %stream.name, error = %e, "no se pudo descartar el stream");
                }
                remove_if_exists(&ref_path);
            }
            Some(Sink::Staged {
                out,
                tmp_path,
                final_path,
            }) => {
                drop(out);
                remove_if_exists(&tmp_path);
                remove_if_exists(&final_path);
            }
            None => {}
        }
    }
}

impl Drop for TaskWriter<'_> {
    fn drop(&mut self) {
        if matches!(self.state, WriterState::Open | WriterState::Writing) {
            debug!(attempt = %self.task_attempt_id, "task writer descartado sin cerrar");
            self.release();
            self.state = WriterState::Failed;
        }
    }
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "no se pudo borrar artefacto");
        }
    }
}

/// Escribe todas las filas de un intento y devuelve su registro de salida.
/// Si algo falla el artefacto queda liberado.
pub fn write_task_output<I>(
    descriptor: &JobDescriptor,
    warehouse: &dyn WarehouseClient,
    task_attempt_id: &str,
    writer_id: u32,
    batch_rows: usize,
    rows: I,
) -> Result<TaskOutputRecord>
where
    I: IntoIterator<Item = Result<Row>>,
{
    let mut writer = TaskWriter::open(descriptor, warehouse, task_attempt_id, writer_id, batch_rows)?;
    for row in rows {
        writer.write_row(&row?)?;
    }
    writer.close()
}
