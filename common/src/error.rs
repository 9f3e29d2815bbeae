//! Errores del conector (taxonomía de fallos del protocolo de escritura).

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Staging ausente o sin permisos, side file ausente, tabla inexistente...
    /// Se reporta al usuario antes de que corra ninguna tarea.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// No existe el job descriptor: la tarea arrancó antes del setup o hubo
    /// una carrera con la limpieza. No se reintenta.
    #[error("missing job state: no job descriptor at {}", path.display())]
    MissingJobState { path: PathBuf },

    /// Un decimal no entra en la precisión/escala del warehouse.
    #[error("precision overflow: {value} does not fit NUMERIC({precision}, {scale})")]
    PrecisionOverflow {
        value: String,
        precision: u32,
        scale: u32,
    },

    /// Valor temporal (o fila) que no se puede codificar.
    #[error("encoding error: {message}")]
    Encoding { message: String },

    /// Falló la carga masiva o el finalize: el job entero se aborta.
    #[error("warehouse commit error on {table}: {message}")]
    WarehouseCommit { table: String, message: String },

    /// Falló una llamada al warehouse fuera de la fase de commit.
    #[error("warehouse error: {message}")]
    Warehouse { message: String },

    /// Sólo se loguea; nunca se propaga fuera del cleanup.
    #[error("cleanup error ({step}): {message}")]
    Cleanup { step: String, message: String },

    #[error("illegal state: {message}")]
    IllegalState { message: String },

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConnectorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    pub fn warehouse(message: impl Into<String>) -> Self {
        Self::Warehouse {
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Errores que sólo invalidan la tarea actual (el engine la reintenta).
    pub fn is_task_local(&self) -> bool {
        matches!(
            self,
            Self::PrecisionOverflow { .. } | Self::Encoding { .. } | Self::Io { .. }
        )
    }
}

/// Adjunta la ruta a un `io::Error`: `fs::read(&p).map_err(io_err(&p))?`.
pub(crate) fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ConnectorError + '_ {
    move |source| ConnectorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errores_locales_de_tarea_se_clasifican_bien() {
        assert!(ConnectorError::encoding("x").is_task_local());
        assert!(ConnectorError::PrecisionOverflow {
            value: "1".into(),
            precision: 38,
            scale: 9
        }
        .is_task_local());
        assert!(!ConnectorError::configuration("x").is_task_local());
        assert!(!ConnectorError::MissingJobState {
            path: PathBuf::from("/tmp/x")
        }
        .is_task_local());
    }

    #[test]
    fn io_err_conserva_la_ruta() {
        let p = PathBuf::from("/no/existe");
        let err = std::fs::read(&p).map_err(io_err(&p)).unwrap_err();
        assert!(err.to_string().contains("/no/existe"));
    }
}
