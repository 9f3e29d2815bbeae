use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::job::JobId;

pub type TaskId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Id del job = query id del protocolo de commit.
    pub job_id: JobId,
    /// Tabla destino (`db.table`), clave del job descriptor.
    pub db_table: String,
    pub partition: u32,
    pub attempt: u32,

    /// Archivo de entrada (JSON lines o CSV)
    pub input_path: String,
}

impl Task {
    /// Id del intento: cambia en cada reintento, así los artefactos de un
    /// intento nuevo nunca pisan los de uno anterior.
    pub fn attempt_id(&self) -> String {
        format!("attempt_{:05}_{}", self.partition, self.attempt)
    }
}

/// Artefacto que deja un intento de tarea.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputArtifact {
    /// Stream pendiente en el warehouse + archivo que lo referencia.
    Stream { stream: String, ref_path: PathBuf },
    /// Archivo staged listo para la carga masiva.
    StagedFile { path: PathBuf },
}

impl OutputArtifact {
    /// Archivo local que prueba que el artefacto existe.
    pub fn local_path(&self) -> &PathBuf {
        match self {
            Self::Stream { ref_path, .. } => ref_path,
            Self::StagedFile { path } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutputRecord {
    pub db_table: String,
    pub task_attempt_id: String,
    pub writer_id: u32,
    pub artifact: OutputArtifact,
    pub row_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_id_cambia_con_el_reintento() {
        let mut t = Task {
            id: "t".into(),
            job_id: "q".into(),
            db_table: "db.t".into(),
            partition: 3,
            attempt: 0,
            input_path: "/in/a.jsonl".into(),
        };
        let first = t.attempt_id();
        t.attempt += 1;
        assert_eq!(first, "attempt_00003_0");
        assert_ne!(first, t.attempt_id());
    }

    #[test]
    fn output_record_viaja_como_json() {
        let rec = TaskOutputRecord {
            db_table: "db.t".into(),
            task_attempt_id: "attempt_00000_0".into(),
            writer_id: 0,
            artifact: OutputArtifact::StagedFile { path: "/s/x.jsonl".into() },
            row_count: 3,
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["artifact"]["kind"], "staged_file");
        let back: TaskOutputRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }
}
