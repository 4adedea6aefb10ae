use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use mrsim::mr::artifact::collect_outputs;
use mrsim::mr::{Engine, EngineConfig, InputMode, OnConflict, Params};
use mrsim::storage::FsStorage;

#[derive(Parser)]
#[command(name = "mrsim")]
struct Args {
    app: String,
    input_ids: Vec<String>,
    /// Directory holding `files/` and `metadata/`. Without `--config` the
    /// store, staging and output paths are placed under it too.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// JSON engine configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    mode: Option<InputMode>,
    /// Batch size bound in bytes.
    #[arg(long)]
    chunk_size: Option<u64>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, value_enum)]
    on_conflict: Option<OnConflict>,
    /// Passed to map and reduce functions, repeatable.
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// Print the merged results after the run.
    #[arg(long)]
    print: bool,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig, anyhow::Error> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::rooted(&self.root),
        };
        if let Some(mode) = self.mode {
            config.input_mode = mode;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(on_conflict) = self.on_conflict {
            config.on_conflict = on_conflict;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = args.engine_config()?;
    let app = mrsim::mrapps::get_app(&args.app)?;
    let storage = Arc::new(FsStorage::new(&args.root));
    let params: Params = args.params.iter().cloned().collect();

    let mut engine = Engine::new(config, app, storage).with_params(params);
    let report = engine
        .execute(args.input_ids.clone())
        .await
        .with_context(|| format!("running {} over {} inputs", args.app, args.input_ids.len()))?;

    log::info!(
        "{} map tasks, {} reduce tasks, outputs in {}",
        report.map_tasks,
        report.groups,
        engine.config().output_dir.display()
    );
    if args.print {
        for (key, value) in collect_outputs(&report.outputs).await? {
            println!("{} {}", key, value);
        }
    }
    Ok(())
}
