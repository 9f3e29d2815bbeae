use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    ExecutionEngine, JobInfo, TableSchema, TableStatistics, WriteJobRequest, WriteStrategy,
};
use reqwest::Client;
use std::{env, fs, path::PathBuf};

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para mandar escrituras al warehouse a través del master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un job de escritura: carga los archivos de INPUT_GLOB en TABLE
    Submit {
        #[arg(value_name = "NOMBRE")]
        name: String,

        /// Tabla destino, proyecto.dataset.tabla
        #[arg(long)]
        table: String,

        /// Archivos de entrada (JSON lines o CSV)
        #[arg(long, default_value = "/data/input/*.jsonl")]
        input_glob: String,

        /// Reemplaza el contenido de la tabla en lugar de agregar
        #[arg(long)]
        overwrite: bool,

        /// mr | tez | spark (default: el del master)
        #[arg(long)]
        engine: Option<ExecutionEngine>,

        /// direct | indirect (default: el del master)
        #[arg(long)]
        write_method: Option<WriteStrategy>,

        /// Nombre db.table del lado del engine
        #[arg(long)]
        db_table: Option<String>,

        /// Schema JSON para crear la tabla si no existe
        #[arg(long, value_name = "SCHEMA_JSON")]
        schema: Option<PathBuf>,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Estadísticas básicas de una tabla
    Stats {
        #[arg(value_name = "TABLE")]
        table: String,
    },
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {:?}", job.status);
    println!("  tabla: {} (db_table={})", job.table, job.db_table);
    println!(
        "  engine: {}, escritura: {}, overwrite: {}",
        job.engine, job.write_method, job.overwrite
    );
    println!(
        "  tareas: total={}, completadas={}, fallidas={}, reintentos={}",
        job.total_tasks, job.completed_tasks, job.failed_tasks, job.retries
    );

    let done = job.completed_tasks + job.failed_tasks;
    if job.total_tasks > 0 {
        let pct = (done as f64 / job.total_tasks as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    } else {
        println!("  progreso: (sin tareas)");
    }

    println!("  input_glob: {}", job.input_glob);
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref started) = job.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = job.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(rows) = job.rows_committed {
        println!("  filas commiteadas: {}", rows);
    }
    if let Some(ref err) = job.error {
        println!("  error: {}", err);
    }
}

fn read_schema(path: &PathBuf) -> Result<TableSchema> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer el schema {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("schema inválido en {}", path.display()))
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit {
            name,
            table,
            input_glob,
            overwrite,
            engine,
            write_method,
            db_table,
            schema,
        } => {
            let url = format!("{}/api/v1/jobs", base_url);
            let req = WriteJobRequest {
                name,
                table,
                db_table,
                input_glob,
                overwrite,
                engine,
                write_method,
                create_schema: schema.as_ref().map(read_schema).transpose()?,
                partitioning: None,
            };

            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                bail!("el master rechazó el job ({}): {}", status, resp.text().await?);
            }
            let job_info: JobInfo = resp.json().await?;
            println!("Job creado:");
            print_job(&job_info);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                print_job(&job);
            } else {
                println!("Error: job no encontrado (status {})", resp.status());
            }
        }

        Commands::Stats { table } => {
            let url = format!("{}/api/v1/tables/{}/stats", base_url, table);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let stats: TableStatistics = resp.json().await?;
                println!("Tabla {}:", table);
                println!("  filas    : {}", stats.num_rows);
                println!("  archivos : {}", stats.num_files);
                println!("  bytes    : {}", stats.total_size);
            } else {
                println!("Error consultando {} (status {})", table, resp.status());
            }
        }
    }

    Ok(())
}
