//! Configuración inmutable de un job de escritura.
//!
//! Se arma una sola vez en el setup (variables de entorno + overrides del
//! builder) y se pasa hacia abajo por referencia; nadie la modifica después.

use serde::{Deserialize, Serialize};
use std::{env, fmt, path::PathBuf, str::FromStr};

use crate::error::ConnectorError;
use crate::trigger::select_trigger;

/* =========================
   Constantes
   ========================= */

pub const JOB_DETAILS_FILE: &str = "job-details.json";
pub const SIDE_FILE_NAME: &str = "spark-job.json";

pub const DEFAULT_WORK_DIR_PREFIX: &str = "whbridge-";
pub const DEFAULT_STREAM_BATCH_ROWS: usize = 500;

/// Hook que el engine dispara cuando el job falla.
pub const FAILURE_HOOK: &str = "whbridge.hooks.on-failure";
/// Hook de commit por tabla (post-ejecución, una vez por tabla de salida).
pub const TABLE_COMMIT_HOOK: &str = "whbridge.hooks.table-commit";
/// Hook post-ejecución que limpia el estado del query.
pub const POST_EXEC_HOOK: &str = "whbridge.hooks.post-exec";

/* =========================
   Enums de configuración
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    /// Streaming al warehouse + finalize atómico.
    Direct,
    /// Archivos intermedios + carga masiva.
    #[serde(alias = "indirect")]
    Staged,
}

impl FromStr for WriteStrategy {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "staged" | "indirect" => Ok(Self::Staged),
            other => Err(ConnectorError::configuration(format!(
                "unknown write method `{other}`, expected `direct` or `staged`"
            ))),
        }
    }
}

impl fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Staged => f.write_str("staged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEngine {
    /// Map/reduce clásico: llama a los callbacks del committer.
    Mr,
    /// Engine DAG: sólo dispara hooks de ciclo de vida.
    Tez,
    /// Engine SQL externo: las tablas llegan por el side file.
    #[serde(rename = "spark")]
    SparkSql,
}

impl FromStr for ExecutionEngine {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mr" => Ok(Self::Mr),
            "tez" => Ok(Self::Tez),
            "spark" => Ok(Self::SparkSql),
            other => Err(ConnectorError::configuration(format!(
                "unknown execution engine `{other}`, expected `mr`, `tez` or `spark`"
            ))),
        }
    }
}

impl fmt::Display for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mr => f.write_str("mr"),
            Self::Tez => f.write_str("tez"),
            Self::SparkSql => f.write_str("spark"),
        }
    }
}

/// Hooks registrados en el engine (canal de propiedades del output job).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSet {
    pub on_failure: Vec<String>,
    pub post_exec: Vec<String>,
    pub table_commit: Vec<String>,
}

impl HookSet {
    fn add(list: &mut Vec<String>, hook: &str) {
        if !list.iter().any(|h| h == hook) {
            list.push(hook.to_string());
        }
    }

    pub fn add_failure_hook(&mut self, hook: &str) {
        Self::add(&mut self.on_failure, hook);
    }

    pub fn add_post_exec_hook(&mut self, hook: &str) {
        Self::add(&mut self.post_exec, hook);
    }

    pub fn add_table_commit_hook(&mut self, hook: &str) {
        Self::add(&mut self.table_commit, hook);
    }

    pub fn has_failure_hook(&self) -> bool {
        self.on_failure.iter().any(|h| h == FAILURE_HOOK)
    }

    pub fn has_table_commit_hook(&self) -> bool {
        self.table_commit.iter().any(|h| h == TABLE_COMMIT_HOOK)
    }
}

/* =========================
   JobConfig
   ========================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    query_id: String,
    engine: ExecutionEngine,
    write_strategy: WriteStrategy,
    work_dir_parent: PathBuf,
    work_dir_prefix: String,
    staging_root: Option<PathBuf>,
    output_job: bool,
    hooks: HookSet,
    stream_batch_rows: usize,
}

impl JobConfig {
    pub fn builder(query_id: impl Into<String>) -> JobConfigBuilder {
        JobConfigBuilder::new(query_id)
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn engine(&self) -> ExecutionEngine {
        self.engine
    }

    pub fn write_strategy(&self) -> WriteStrategy {
        self.write_strategy
    }

    pub fn work_dir_parent(&self) -> &std::path::Path {
        &self.work_dir_parent
    }

    pub fn work_dir_prefix(&self) -> &str {
        &self.work_dir_prefix
    }

    pub fn staging_root(&self) -> Option<&std::path::Path> {
        self.staging_root.as_deref()
    }

    /// `true` si el query actual escribe en al menos una tabla del warehouse.
    pub fn output_job(&self) -> bool {
        self.output_job
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    pub fn stream_batch_rows(&self) -> usize {
        self.stream_batch_rows
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

#[derive(Debug, Clone)]
pub struct JobConfigBuilder {
    query_id: String,
    engine: ExecutionEngine,
    write_strategy: WriteStrategy,
    work_dir_parent: PathBuf,
    work_dir_prefix: String,
    staging_root: Option<PathBuf>,
    output_job: bool,
    stream_batch_rows: usize,
}

impl JobConfigBuilder {
    /// Builder con los valores por defecto, sin mirar el entorno.
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            engine: ExecutionEngine::Mr,
            write_strategy: WriteStrategy::Direct,
            work_dir_parent: env::temp_dir(),
            work_dir_prefix: DEFAULT_WORK_DIR_PREFIX.to_string(),
            staging_root: None,
            output_job: true,
            stream_batch_rows: DEFAULT_STREAM_BATCH_ROWS,
        }
    }

    /// Lee EXECUTION_ENGINE, WRITE_METHOD, WORK_DIR_PARENT, WORK_DIR_PREFIX,
    /// STAGING_ROOT y STREAM_BATCH_ROWS. Valores inválidos caen al default.
    pub fn from_env(query_id: impl Into<String>) -> Self {
        let mut b = Self::new(query_id);
        if let Some(engine) = env_parse::<ExecutionEngine>("EXECUTION_ENGINE") {
            b.engine = engine;
        }
        if let Some(strategy) = env_parse::<WriteStrategy>("WRITE_METHOD") {
            b.write_strategy = strategy;
        }
        if let Ok(parent) = env::var("WORK_DIR_PARENT") {
            b.work_dir_parent = PathBuf::from(parent);
        }
        if let Ok(prefix) = env::var("WORK_DIR_PREFIX") {
            b.work_dir_prefix = prefix;
        }
        b.staging_root = env::var("STAGING_ROOT").ok().map(PathBuf::from);
        b.stream_batch_rows = env_parse::<usize>("STREAM_BATCH_ROWS")
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_STREAM_BATCH_ROWS);
        b
    }

    pub fn query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = query_id.into();
        self
    }

    pub fn engine(mut self, engine: ExecutionEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.write_strategy = strategy;
        self
    }

    pub fn work_dir_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.work_dir_parent = parent.into();
        self
    }

    pub fn work_dir_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.work_dir_prefix = prefix.into();
        self
    }

    pub fn staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    pub fn output_job(mut self, output_job: bool) -> Self {
        self.output_job = output_job;
        self
    }

    pub fn stream_batch_rows(mut self, rows: usize) -> Self {
        self.stream_batch_rows = rows.max(1);
        self
    }

    /// Congela la config. El trigger del engine registra sus hooks acá, así
    /// quedan fijados antes de que corra cualquier tarea.
    pub fn build(self) -> JobConfig {
        let mut hooks = HookSet::default();
        if self.output_job {
            select_trigger(self.engine).register_hooks(&mut hooks);
        }
        JobConfig {
            query_id: self.query_id,
            engine: self.engine,
            write_strategy: self.write_strategy,
            work_dir_parent: self.work_dir_parent,
            work_dir_prefix: self.work_dir_prefix,
            staging_root: self.staging_root,
            output_job: self.output_job,
            hooks,
            stream_batch_rows: self.stream_batch_rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_estrategias_y_engines() {
        assert_eq!("direct".parse::<WriteStrategy>().unwrap(), WriteStrategy::Direct);
        assert_eq!("INDIRECT".parse::<WriteStrategy>().unwrap(), WriteStrategy::Staged);
        assert!("bulk".parse::<WriteStrategy>().is_err());
        assert_eq!("spark".parse::<ExecutionEngine>().unwrap(), ExecutionEngine::SparkSql);
        assert!(matches!(
            "flink".parse::<ExecutionEngine>(),
            Err(ConnectorError::Configuration { .. })
        ));
    }

    #[test]
    fn builder_aplica_overrides() {
        let cfg = JobConfig::builder("q1")
            .engine(ExecutionEngine::Tez)
            .write_strategy(WriteStrategy::Staged)
            .work_dir_prefix("p-")
            .staging_root("/tmp/staging")
            .stream_batch_rows(0)
            .build();
        assert_eq!(cfg.query_id(), "q1");
        assert_eq!(cfg.engine(), ExecutionEngine::Tez);
        assert_eq!(cfg.write_strategy(), WriteStrategy::Staged);
        assert_eq!(cfg.work_dir_prefix(), "p-");
        assert_eq!(cfg.staging_root(), Some(std::path::Path::new("/tmp/staging")));
        assert_eq!(cfg.stream_batch_rows(), 1);
    }

    #[test]
    fn strategy_se_serializa_en_minusculas() {
        assert_eq!(
            serde_json::to_string(&WriteStrategy::Staged).unwrap(),
            "\"staged\""
        );
        let s: WriteStrategy = serde_json::from_str("\"indirect\"").unwrap();
        assert_eq!(s, WriteStrategy::Staged);
    }

    #[test]
    fn hookset_no_duplica() {
        let mut hooks = HookSet::default();
        hooks.add_failure_hook(FAILURE_HOOK);
        hooks.add_failure_hook(FAILURE_HOOK);
        assert_eq!(hooks.on_failure.len(), 1);
        assert!(hooks.has_failure_hook());
        assert!(!hooks.has_table_commit_hook());
    }
}
