use std::sync::Arc;

use clap::Parser;
use tokio::fs::File;
use tokio::io::AsyncWriteExt as _;

use mrsim::storage::FsStorage;

#[derive(Parser)]
#[command(name = "mrsequential")]
struct Args {
    app: String,
    input_ids: Vec<String>,
    /// Directory holding `files/` and `metadata/`.
    #[arg(long, default_value = ".")]
    root: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let args = Args::try_parse()?;

    println!("app: {}, inputs: {:?}", args.app, args.input_ids);
    let app = mrsim::mrapps::get_app(&args.app)?;
    let storage = Arc::new(FsStorage::new(&args.root));

    let results = mrsim::mrrt::sequential::run(app.as_ref(), storage, args.input_ids, Arc::default()).await?;

    let out_file = "mr-out-0";
    let mut out = File::create(out_file).await?;
    for kv in results {
        out.write_all(format!("{} {}\n", kv.key, kv.value).as_bytes()).await?;
    }
    out.flush().await?;

    Ok(())
}
