use clap::{Parser, Subcommand};
use workchain::actions::WorkExecutor;
use workchain::actions::image::{blur_chain, BlurWorker, CleanupWorker, SaveImageWorker};
use workchain::compiler::core::ChainCompiler;
use workchain::compiler::loader::{load_chain_from_yaml, load_config_from_yaml};
use workchain::dsl::ChainSpec;
use workchain::image::{FileImageStore, ImageStore};
use workchain::image::http::HttpImageSource;
use workchain::runtime::constraint::Environment;
use workchain::runtime::status::{StatusEvent, StatusFilter};
use workchain::text::{TextExtractor, Utf8TextRecognizer};
use workchain::{Orchestrator, OrchestratorConfig};
use std::sync::Arc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Result, anyhow};
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Orchestrator config YAML
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct DeviceArgs {
    /// Directory images are read from and written to
    #[arg(long, default_value = ".")]
    store: PathBuf,

    /// Start with the device charging
    #[arg(long)]
    charging: bool,

    /// Simulate plugging in the charger after this many milliseconds
    #[arg(long)]
    charge_after_ms: Option<u64>,

    /// Artificial delay per blur/save task, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chain defined in a YAML file
    Run {
        /// Path to the chain YAML file
        #[arg(long, short)]
        file: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Blur an image: cleanup, N blur passes, save once charging
    Blur {
        /// Image locator relative to the store
        #[arg(long, short)]
        image: String,

        /// Number of blur passes
        #[arg(long, short, default_value_t = 1)]
        level: usize,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Recognize text in an image file or URL
    Recognize {
        /// Local path or http(s) URL
        image: String,
    },
}

fn standard_executor(store: Arc<dyn ImageStore>, delay: Duration) -> WorkExecutor {
    WorkExecutor::new()
        .with(Arc::new(CleanupWorker::new(store.clone())))
        .with(Arc::new(BlurWorker::new(store.clone()).with_delay(delay)))
        .with(Arc::new(SaveImageWorker::new(store).with_delay(delay)))
}

fn describe(event: &StatusEvent) {
    match event {
        StatusEvent::Task(t) => info!(chain = %t.chain_name, position = t.position, kind = %t.kind, state = ?t.state, "task"),
        StatusEvent::Chain(c) => info!(chain = %c.name, state = ?c.state, "chain"),
    }
}

async fn run_chain(spec: ChainSpec, config: OrchestratorConfig, device: DeviceArgs) -> Result<()> {
    let store: Arc<dyn ImageStore> = Arc::new(FileImageStore::new(&device.store));
    let executor = standard_executor(store, Duration::from_millis(device.delay_ms));
    let environment = Environment {
        charging: device.charging,
        ..Environment::default()
    };
    let orchestrator = Orchestrator::with_environment(config, executor, environment);
    let mut events = orchestrator.subscribe(StatusFilter::All);

    let name = spec.name.clone();
    let chain = ChainCompiler::new().compile(spec)?;
    let id = orchestrator.submit(chain).await?;
    info!(chain = %name, chain_id = %id, "Submitted (Ctrl+C to cancel)");

    let charge = async {
        match device.charge_after_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(charge);
    let mut charged = device.charging;

    let state = loop {
        tokio::select! {
            Some(event) = events.recv() => describe(&event),
            _ = &mut charge, if !charged => {
                charged = true;
                info!("Charger connected");
                orchestrator.environment().set_charging(true);
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(chain = %name, "Interrupted, cancelling");
                orchestrator.cancel(&name).await;
            }
            state = orchestrator.wait_for_chain(id) => break state,
        }
    };

    let statuses = orchestrator.status_by_name(&name);
    orchestrator.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    info!(chain = %name, state = ?state, "Done");
    Ok(())
}

async fn recognize(image: &str) -> Result<()> {
    let (source, locator): (Arc<dyn ImageStore>, String) = if image.starts_with("http://") || image.starts_with("https://") {
        (Arc::new(HttpImageSource::new()), image.to_string())
    } else {
        let path = Path::new(image);
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("Not a file: {}", image))?
            .to_string_lossy()
            .to_string();
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        (Arc::new(FileImageStore::new(dir)), file_name)
    };

    let extractor = TextExtractor::new(source, Arc::new(Utf8TextRecognizer));
    let result = extractor.extract(&locator).await?;
    println!("{}", result.text());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_from_yaml(path)?,
        None => OrchestratorConfig::default(),
    };

    match cli.command {
        Commands::Run { file, device } => {
            let spec = load_chain_from_yaml(&file)?;
            info!("Loaded chain: {}", spec.name);
            run_chain(spec, config, device).await?;
        }
        Commands::Blur { image, level, device } => {
            run_chain(blur_chain(&image, level), config, device).await?;
        }
        Commands::Recognize { image } => {
            recognize(&image).await?;
        }
    }

    Ok(())
}
