//! Escenarios completos del protocolo de commit: setup, tareas, commit/abort
//! por engine y limpieza, contra el warehouse local.

use chrono::NaiveDate;
use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tempfile::TempDir;

use common::{
    paths,
    setup::{prepare_output_table, CreateTable},
    side_file::SparkJobFile,
    staged,
    warehouse::{LoadOptions, LoadResult, StreamRef, TableInfo},
    writer::write_task_output,
    CommitCoordinator, ConnectorError, DescriptorLocation, ExecutionEngine, FieldSchema,
    FieldType, JobConfig, JobDescriptor, LocalWarehouse, Result, Row, TableId, TableSchema,
    TableStatistics, Task, TaskOutputRecord, Value, WarehouseClient, WarehouseRow,
    WarehouseValue, WriteStrategy,
};
use common::schema::Partitioning;
use common::select_trigger;

const DB_TABLE: &str = "ventas.pedidos";

struct Env {
    _work: TempDir,
    _staging: TempDir,
    root: TempDir,
    config: Arc<JobConfig>,
    warehouse: Arc<dyn WarehouseClient>,
    local: Arc<LocalWarehouse>,
}

fn table_id() -> TableId {
    TableId::new("proj", "ventas", "pedidos")
}

fn schema() -> TableSchema {
    TableSchema::new(vec![
        FieldSchema::new("id", FieldType::Integer).required(),
        FieldSchema::new("origen", FieldType::String),
        FieldSchema::new("creado", FieldType::Datetime),
    ])
}

fn env_with(query_id: &str, engine: ExecutionEngine, strategy: WriteStrategy) -> Env {
    let work = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let config = Arc::new(
        JobConfig::builder(query_id)
            .engine(engine)
            .write_strategy(strategy)
            .work_dir_parent(work.path())
            .staging_root(staging.path())
            .stream_batch_rows(2)
            .build(),
    );
    let local = Arc::new(LocalWarehouse::new(root.path()));
    Env {
        _work: work,
        _staging: staging,
        root,
        config,
        warehouse: local.clone(),
        local,
    }
}

fn env(engine: ExecutionEngine, strategy: WriteStrategy) -> Env {
    env_with("q-0001", engine, strategy)
}

fn row(id: i64, origen: &str) -> Row {
    vec![
        Value::Int64(id),
        Value::String(origen.to_string()),
        Value::Timestamp(
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_micro_opt(10, 0, 0, id as u32)
                .unwrap(),
        ),
    ]
}

fn setup(env: &Env, overwrite: bool) -> JobDescriptor {
    let s = schema();
    prepare_output_table(
        &env.config,
        env.warehouse.as_ref(),
        DB_TABLE,
        &table_id(),
        overwrite,
        Some(CreateTable {
            schema: &s,
            partitioning: None,
        }),
    )
    .unwrap()
}

fn task(partition: u32, attempt: u32) -> Task {
    Task {
        id: format!("t{partition}"),
        job_id: "q-0001".into(),
        db_table: DB_TABLE.into(),
        partition,
        attempt,
        input_path: String::new(),
    }
}

fn run_task(env: &Env, desc: &JobDescriptor, t: &Task, rows: Vec<Row>) -> Result<TaskOutputRecord> {
    write_task_output(
        desc,
        env.warehouse.as_ref(),
        &t.attempt_id(),
        0,
        env.config.stream_batch_rows(),
        rows.into_iter().map(Ok),
    )
}

/// Mete filas visibles en la tabla sin pasar por el protocolo.
fn seed(env: &Env, n: i64, origen: &str) {
    let rows: Vec<WarehouseRow> = (0..n)
        .map(|i| {
            vec![
                WarehouseValue::Int64(i),
                WarehouseValue::String(origen.into()),
                WarehouseValue::Null,
            ]
        })
        .collect();
    let s = env.warehouse.create_write_stream(&table_id()).unwrap();
    env.warehouse.stream_insert(&table_id(), &s, &rows).unwrap();
    env.warehouse.finalize(&table_id(), &[s], false).unwrap();
}

fn origins(env: &Env) -> Vec<String> {
    env.warehouse
        .read_rows(&table_id())
        .unwrap()
        .into_iter()
        .map(|r| match &r[1] {
            WarehouseValue::String(s) => s.clone(),
            other => panic!("origen inesperado: {other:?}"),
        })
        .collect()
}

fn manifest_bytes(env: &Env) -> Vec<u8> {
    fs::read(env.root.path().join("proj/ventas/pedidos/manifest.json")).unwrap()
}

/* =========================
   Staged
   ========================= */

#[test]
fn dos_tareas_de_tres_filas_hacen_una_sola_carga_de_seis() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Staged);
    let desc = setup(&env, false);
    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let trigger = select_trigger(env.config.engine());

    let mut artifacts = Vec::new();
    for p in 0..2 {
        let rows = (0..3).map(|i| row(p * 10 + i, "nuevo")).collect();
        let rec = run_task(&env, &desc, &task(p as u32, 0), rows).unwrap();
        trigger.on_task_commit(&coord, &rec).unwrap();
        artifacts.push(rec.artifact.local_path().clone());
    }

    let outcomes = trigger.on_job_commit(&coord, &[DB_TABLE.to_string()]).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1.rows, 6);
    assert_eq!(outcomes[0].1.artifacts, 2);

    let stats = env.warehouse.list_table_basic_statistics(&table_id()).unwrap();
    assert_eq!(stats.num_rows, 6);
    assert_eq!(stats.num_files, 1, "una sola carga");

    for a in artifacts {
        assert!(!a.exists(), "quedó el artefacto {}", a.display());
    }
    assert!(!DescriptorLocation::for_table(&env.config, DB_TABLE).exists());
    assert!(!desc.temp_output_dir().exists());

    trigger.on_query_complete(&coord);
    assert!(!paths::query_work_dir(&env.config).exists());
}

#[test]
fn staging_vacio_no_muta_la_tabla() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Staged);
    setup(&env, true);
    seed(&env, 2, "viejo");
    let before = manifest_bytes(&env);

    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let outcome = coord.finish_table(DB_TABLE, None).unwrap();
    assert_eq!(outcome.rows, 0);
    assert_eq!(outcome.artifacts, 0);
    assert_eq!(manifest_bytes(&env), before);
    assert_eq!(origins(&env), vec!["viejo", "viejo"]);
}

#[test]
fn abort_tras_fallo_parcial_deja_la_tabla_igual() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Staged);
    let desc = setup(&env, false);
    seed(&env, 2, "viejo");
    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let trigger = select_trigger(env.config.engine());

    let ok = run_task(&env, &desc, &task(0, 0), vec![row(1, "nuevo"), row(2, "nuevo")]).unwrap();
    trigger.on_task_commit(&coord, &ok).unwrap();

    // la segunda tarea falla a mitad de camino: NULL en un campo REQUIRED
    let mut bad = row(3, "nuevo");
    bad[0] = Value::Null;
    let err = run_task(&env, &desc, &task(1, 0), vec![row(4, "nuevo"), bad]).unwrap_err();
    assert!(err.is_task_local());

    trigger.on_job_abort(&coord, &[DB_TABLE.to_string()]);

    assert_eq!(origins(&env), vec!["viejo", "viejo"]);
    let left = staged::list_all_with_prefix(desc.temp_output_dir(), "").unwrap();
    assert!(left.is_empty(), "quedaron archivos staged: {left:?}");
    assert!(!DescriptorLocation::for_table(&env.config, DB_TABLE).exists());
}

#[test]
fn overwrite_staged_un_lector_concurrente_ve_todo_viejo_o_todo_nuevo() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Staged);
    let desc = setup(&env, true);
    seed(&env, 40, "viejo");

    for p in 0..4 {
        let rows = (0..10).map(|i| row(p * 100 + i, "nuevo")).collect();
        run_task(&env, &desc, &task(p as u32, 0), rows).unwrap();
    }

    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let done = AtomicBool::new(false);
    let mut snapshots = Vec::new();

    std::thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut seen = Vec::new();
            while !done.load(Ordering::SeqCst) {
                seen.push(origins(&env));
            }
            seen.push(origins(&env));
            seen
        });

        let outcome = coord.finish_table(DB_TABLE, None).unwrap();
        assert_eq!(outcome.rows, 40);
        done.store(true, Ordering::SeqCst);
        snapshots = reader.join().unwrap();
    });

    for snap in &snapshots {
        assert_eq!(snap.len(), 40);
        let all_old = snap.iter().all(|o| o == "viejo");
        let all_new = snap.iter().all(|o| o == "nuevo");
        assert!(all_old || all_new, "lectura mezclada: {snap:?}");
    }
    assert!(snapshots.last().unwrap().iter().all(|o| o == "nuevo"));

    // la tabla temporal del overwrite no sobrevive al cleanup
    let scratch = paths::scratch_table_id(&table_id(), env.config.query_id());
    assert!(env.warehouse.get_table(&scratch).unwrap().is_none());
}

/* =========================
   Direct
   ========================= */

#[test]
fn commit_directo_es_idempotente() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Direct);
    let desc = setup(&env, false);
    for p in 0..2 {
        let rows = (0..3).map(|i| row(p * 10 + i, "nuevo")).collect();
        run_task(&env, &desc, &task(p as u32, 0), rows).unwrap();
    }

    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let first = coord.commit_job(&desc, false).unwrap();
    assert_eq!(first.rows, 6);
    let again = coord.commit_job(&desc, false).unwrap();
    assert!(again.already_committed);

    // otro proceso repite el commit: el warehouse ignora streams ya commiteados
    let other = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let replay = other.commit_job(&desc, false).unwrap();
    assert_eq!(replay.rows, 0);

    assert_eq!(env.warehouse.list_table_basic_statistics(&table_id()).unwrap().num_rows, 6);
}

#[test]
fn abort_directo_descarta_los_streams_pendientes() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Direct);
    let desc = setup(&env, false);
    let rec = run_task(&env, &desc, &task(0, 0), vec![row(1, "nuevo"), row(2, "nuevo"), row(3, "nuevo")])
        .unwrap();

    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    coord.abandon_table(DB_TABLE);

    assert!(origins(&env).is_empty());
    let common::OutputArtifact::Stream { stream, ref_path } = rec.artifact else {
        panic!("esperaba un stream");
    };
    assert!(!ref_path.exists());
    assert!(env
        .warehouse
        .finalize(&table_id(), &[StreamRef::new(stream)], false)
        .is_err());
}

#[test]
fn reintento_no_choca_con_el_intento_perdido() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Staged);
    let desc = setup(&env, false);
    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());

    // el intento 0 terminó pero su worker se perdió: el master lo aborta
    let lost = run_task(&env, &desc, &task(0, 0), vec![row(1, "perdido")]).unwrap();
    let retry = run_task(&env, &desc, &task(0, 1), vec![row(1, "nuevo")]).unwrap();
    assert_ne!(lost.artifact, retry.artifact);

    assert_eq!(coord.abort_task(DB_TABLE, &task(0, 0).attempt_id()).unwrap(), 1);
    coord.commit_task(&retry).unwrap();
    coord.finish_table(DB_TABLE, None).unwrap();
    assert_eq!(origins(&env), vec!["nuevo"]);
}

#[test]
fn tez_reintento_no_carga_el_intento_perdido() {
    let env = env(ExecutionEngine::Tez, WriteStrategy::Staged);
    let desc = setup(&env, false);
    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let trigger = select_trigger(env.config.engine());

    run_task(&env, &desc, &task(0, 0), vec![row(1, "perdido")]).unwrap();
    trigger.on_task_abort(&coord, DB_TABLE, &task(0, 0).attempt_id()).unwrap();
    let retry = run_task(&env, &desc, &task(0, 1), vec![row(1, "nuevo")]).unwrap();
    trigger.on_task_commit(&coord, &retry).unwrap();

    let outcome = trigger.on_table_commit_hook(&coord, DB_TABLE, false).unwrap().unwrap();
    assert_eq!(outcome.rows, 1);
    assert_eq!(origins(&env), vec!["nuevo"]);
}

/* =========================
   Engines
   ========================= */

#[test]
fn tez_commitea_solo_desde_el_hook_de_tabla() {
    let env = env(ExecutionEngine::Tez, WriteStrategy::Staged);
    let desc = setup(&env, false);
    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let trigger = select_trigger(env.config.engine());

    let rec = run_task(&env, &desc, &task(0, 0), vec![row(1, "nuevo")]).unwrap();
    trigger.on_task_commit(&coord, &rec).unwrap();

    // los callbacks del committer no hacen nada en este engine
    assert!(trigger.on_job_commit(&coord, &[DB_TABLE.to_string()]).unwrap().is_empty());
    assert!(origins(&env).is_empty());

    let outcome = trigger.on_table_commit_hook(&coord, DB_TABLE, false).unwrap().unwrap();
    assert_eq!(outcome.rows, 1);
    assert_eq!(origins(&env), vec!["nuevo"]);
}

#[test]
fn tez_hook_de_fallo_aborta_las_tablas() {
    let env = env(ExecutionEngine::Tez, WriteStrategy::Staged);
    let desc = setup(&env, false);
    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let trigger = select_trigger(env.config.engine());
    run_task(&env, &desc, &task(0, 0), vec![row(1, "nuevo")]).unwrap();

    trigger.on_failure_hook(&coord, &[DB_TABLE.to_string()]);
    assert!(origins(&env).is_empty());
    assert!(staged::list_all_with_prefix(desc.temp_output_dir(), "").unwrap().is_empty());
    assert!(!DescriptorLocation::for_table(&env.config, DB_TABLE).exists());
}

#[test]
fn spark_overwrite_sale_del_side_file() {
    let env = env(ExecutionEngine::SparkSql, WriteStrategy::Direct);
    let desc = setup(&env, true);
    seed(&env, 3, "viejo");
    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let trigger = select_trigger(env.config.engine());

    let rec = run_task(&env, &desc, &task(0, 0), vec![row(1, "nuevo")]).unwrap();
    trigger.on_task_commit(&coord, &rec).unwrap();
    let outcomes = trigger.on_job_commit(&coord, &[]).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(origins(&env), vec!["nuevo"]);

    trigger.on_query_complete(&coord);
    assert!(SparkJobFile::read(&env.config).is_err());
}

#[test]
fn spark_sin_side_file_es_error_de_configuracion() {
    let env = env(ExecutionEngine::SparkSql, WriteStrategy::Staged);
    let desc = setup(&env, false);
    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let trigger = select_trigger(env.config.engine());
    run_task(&env, &desc, &task(0, 0), vec![row(1, "nuevo")]).unwrap();

    SparkJobFile::delete(&env.config).unwrap();
    let err = trigger.on_job_commit(&coord, &[DB_TABLE.to_string()]).unwrap_err();
    assert!(matches!(err, ConnectorError::Configuration { .. }));
    assert!(err.to_string().contains("spark.sql.extensions"));
    assert!(origins(&env).is_empty());
    assert!(!DescriptorLocation::for_table(&env.config, DB_TABLE).exists());
}

#[test]
fn sin_output_job_el_commit_por_callback_no_hace_nada() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Staged);
    let desc = setup(&env, false);
    run_task(&env, &desc, &task(0, 0), vec![row(1, "nuevo")]).unwrap();

    let not_output = Arc::new(
        JobConfig::builder(env.config.query_id())
            .work_dir_parent(env.config.work_dir_parent())
            .staging_root(env.config.staging_root().unwrap())
            .write_strategy(WriteStrategy::Staged)
            .output_job(false)
            .build(),
    );
    let coord = CommitCoordinator::new(not_output.clone(), env.warehouse.clone());
    let trigger = select_trigger(not_output.engine());

    assert!(trigger.on_job_commit(&coord, &[DB_TABLE.to_string()]).unwrap().is_empty());
    trigger.on_job_abort(&coord, &[DB_TABLE.to_string()]);
    assert!(origins(&env).is_empty());
    // nada se tocó: el descriptor sigue ahí
    assert!(DescriptorLocation::for_table(&env.config, DB_TABLE).exists());
}

/* =========================
   Errores
   ========================= */

#[test]
fn descriptor_ausente_es_missing_job_state() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Direct);
    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let err = coord.finish_table(DB_TABLE, None).unwrap_err();
    assert!(matches!(err, ConnectorError::MissingJobState { .. }));
    assert!(!err.is_task_local());
}

/// Warehouse que delega en el local pero nunca puede borrar tablas.
struct NoDeleteWarehouse(LocalWarehouse);

impl WarehouseClient for NoDeleteWarehouse {
    fn get_table(&self, id: &TableId) -> Result<Option<TableInfo>> {
        self.0.get_table(id)
    }
    fn create_table(&self, id: &TableId, schema: &TableSchema, p: Option<&Partitioning>) -> Result<TableInfo> {
        self.0.create_table(id, schema, p)
    }
    fn delete_table(&self, _id: &TableId) -> Result<bool> {
        Err(ConnectorError::warehouse("permission denied"))
    }
    fn load_from_files(&self, id: &TableId, files: &[PathBuf], o: LoadOptions) -> Result<LoadResult> {
        self.0.load_from_files(id, files, o)
    }
    fn create_write_stream(&self, id: &TableId) -> Result<StreamRef> {
        self.0.create_write_stream(id)
    }
    fn stream_insert(&self, id: &TableId, s: &StreamRef, rows: &[WarehouseRow]) -> Result<u64> {
        self.0.stream_insert(id, s, rows)
    }
    fn finalize(&self, id: &TableId, s: &[StreamRef], truncate: bool) -> Result<u64> {
        self.0.finalize(id, s, truncate)
    }
    fn discard(&self, id: &TableId, s: &StreamRef) -> Result<()> {
        self.0.discard(id, s)
    }
    fn replace_table(&self, target: &TableId, source: &TableId) -> Result<()> {
        self.0.replace_table(target, source)
    }
    fn list_table_basic_statistics(&self, id: &TableId) -> Result<TableStatistics> {
        self.0.list_table_basic_statistics(id)
    }
    fn read_rows(&self, id: &TableId) -> Result<Vec<WarehouseRow>> {
        self.0.read_rows(id)
    }
}

#[test]
fn fallo_de_cleanup_no_falla_un_job_commiteado() {
    let mut env = env(ExecutionEngine::Mr, WriteStrategy::Staged);
    env.warehouse = Arc::new(NoDeleteWarehouse(LocalWarehouse::new(env.root.path())));
    let desc = setup(&env, true);
    run_task(&env, &desc, &task(0, 0), vec![row(1, "nuevo"), row(2, "nuevo")]).unwrap();

    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let outcome = coord.finish_table(DB_TABLE, None).unwrap();
    assert_eq!(outcome.rows, 2);
    assert_eq!(origins(&env), vec!["nuevo", "nuevo"]);

    // el borrado de la tabla temporal falló y sólo se logueó
    let scratch = paths::scratch_table_id(&table_id(), env.config.query_id());
    assert!(env.local.get_table(&scratch).unwrap().is_some());
    // el resto de la limpieza sí corrió
    assert!(!DescriptorLocation::for_table(&env.config, DB_TABLE).exists());
}

#[test]
fn falla_del_warehouse_en_el_commit_aborta_y_devuelve_el_error_original() {
    let env = env(ExecutionEngine::Mr, WriteStrategy::Direct);
    let desc = setup(&env, false);
    let rec = run_task(&env, &desc, &task(0, 0), vec![row(1, "nuevo")]).unwrap();

    // un stream descartado por fuera hace fallar el finalize
    let common::OutputArtifact::Stream { stream, .. } = &rec.artifact else {
        panic!("esperaba un stream");
    };
    env.warehouse
        .discard(&table_id(), &StreamRef::new(stream.clone()))
        .unwrap();

    let coord = CommitCoordinator::new(env.config.clone(), env.warehouse.clone());
    let err = coord.finish_table(DB_TABLE, None).unwrap_err();
    assert!(matches!(err, ConnectorError::WarehouseCommit { .. }), "{err}");
    assert_eq!(coord.state(DB_TABLE), common::CommitState::Aborted);
    assert!(origins(&env).is_empty());
    assert!(!rec.artifact.local_path().exists());
}
