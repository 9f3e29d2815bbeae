use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::ConnectorError;

/// Identidad de una tabla del warehouse: `proyecto.dataset.tabla`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableId {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Prefijo usado para nombrar los artefactos temporales de la tabla.
    /// `$` (decoradores de partición) y `:` (proyectos con dominio) no son
    /// válidos en nombres de archivo, se reemplazan por `__`.
    pub fn prefix(&self) -> String {
        format!(
            "{}_{}_{}",
            self.project,
            self.dataset,
            self.table.replace('$', "__")
        )
        .replace(':', "__")
    }

    /// Misma tabla con otro nombre, en el mismo dataset.
    pub fn with_table(&self, table: impl Into<String>) -> Self {
        Self {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

impl FromStr for TableId {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().splitn(3, '.').collect();
        match parts.as_slice() {
            [project, dataset, table]
                if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
            {
                Ok(TableId::new(*project, *dataset, *table))
            }
            _ => Err(ConnectorError::configuration(format!(
                "invalid table id `{s}`, expected `project.dataset.table`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Integer,
    Float,
    Boolean,
    String,
    Bytes,
    Date,
    /// Fecha/hora civil, sin zona.
    Datetime,
    /// Instante absoluto (UTC).
    Timestamp,
    Numeric,
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    /// Sub-campos, sólo para `RECORD`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// REPEATED RECORD `{key, value}` que viene de un map del motor.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub map: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
            fields: Vec::new(),
            precision: None,
            scale: None,
            map: false,
        }
    }

    /// Campo map: REPEATED RECORD con `key` (REQUIRED) y `value`.
    pub fn map(name: impl Into<String>, key_type: FieldType, value: FieldSchema) -> Self {
        let value = FieldSchema { name: "value".into(), ..value };
        Self {
            map: true,
            ..Self::record(name, vec![FieldSchema::new("key", key_type).required(), value]).repeated()
        }
    }

    pub fn record(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            fields,
            ..Self::new(name, FieldType::Record)
        }
    }

    pub fn required(mut self) -> Self {
        self.mode = FieldMode::Required;
        self
    }

    pub fn repeated(mut self) -> Self {
        self.mode = FieldMode::Repeated;
        self
    }

    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// El mismo campo visto como elemento individual (para recorrer arrays).
    pub fn element(&self) -> FieldSchema {
        FieldSchema {
            mode: FieldMode::Nullable,
            ..self.clone()
        }
    }

    /// Sólo los campos marcados como map; un REPEATED RECORD declarado por el
    /// usuario con sub-campos `key`/`value` sigue siendo un array de records.
    pub fn is_map(&self) -> bool {
        self.map
            && self.mode == FieldMode::Repeated
            && self.field_type == FieldType::Record
            && self.fields.len() == 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionKind {
    Hour,
    Day,
    Month,
    Year,
}

/// Particionado por tiempo. `field = None` significa particionado por
/// tiempo de ingesta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partitioning {
    pub kind: PartitionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}
