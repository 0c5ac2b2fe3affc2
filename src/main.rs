use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use idmatch::config::{self, Config};
use idmatch::enroll::Enroller;
use idmatch::storage::{FileAccountStore, ReferenceKind};
use idmatch::verify::{compare_uploaded_signatures, FaceVerifier, SignatureVerifier};
use idmatch::upload::read_upload;
use idmatch::{FaceEmbedder, Normalizer, Pipeline, VerifyError};
use log::{error, info};
use serde::Serialize;
use tokio::runtime::Runtime;

#[derive(Parser)]
#[command(name = "idmatch")]
#[command(
    version,
    about = "Face and signature verification against enrolled account references"
)]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Face,
    Signature,
}

impl From<KindArg> for ReferenceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Face => ReferenceKind::Face,
            KindArg::Signature => ReferenceKind::Signature,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two signature images pixel by pixel
    CompareSignatures { first: PathBuf, second: PathBuf },
    /// Match a live photo against the faces enrolled for an account
    VerifyFace {
        #[arg(short, long)]
        account: String,
        live: PathBuf,
    },
    /// Match a signature against the signatures enrolled for an account
    VerifySignature {
        #[arg(short, long)]
        account: String,
        image: PathBuf,
    },
    /// Add a reference image to an account
    Enroll {
        #[arg(short, long)]
        account: String,
        #[arg(short, long, value_enum, default_value_t = KindArg::Face)]
        kind: KindArg,
        /// Identifier to store the reference under (random UUID otherwise)
        #[arg(long)]
        source_id: Option<String>,
        image: PathBuf,
    },
    /// Show the references stored for an account
    List {
        #[arg(short, long)]
        account: String,
    },
    /// Set how many signature references must match
    RequireSignatures {
        #[arg(short, long)]
        account: String,
        count: u32,
    },
    /// Remove all references of an account
    Purge {
        #[arg(short, long)]
        account: String,
    },
    /// Open config file in editor
    Config,
}

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
        .and_then(|runtime| run(cli, &runtime));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<VerifyError>() {
            Some(verify) => {
                match serde_json::to_string(&verify.report()) {
                    Ok(body) => eprintln!("{body}"),
                    Err(_) => eprintln!("{verify}"),
                }
                verify.exit_code()
            }
            None => {
                error!("{:#}", err);
                ExitCode::FAILURE
            }
        },
    }
}

fn run(cli: Cli, runtime: &Runtime) -> Result<()> {
    let cfg = config::load_config(cli.config.as_deref())?;
    let store = || FileAccountStore::new(&cfg.store.prefix);
    let normalizer = Normalizer::new(cfg.normalize_config());

    match cli.command {
        Commands::CompareSignatures { first, second } => {
            let first = read_upload(&first, &normalizer)?;
            let second = read_upload(&second, &normalizer)?;
            let result = compare_uploaded_signatures(&normalizer, &first, &second)?;
            print_json(&result)
        }
        Commands::VerifyFace { account, live } => {
            let live = read_upload(&live, &normalizer)?;
            let verifier = FaceVerifier::new(Arc::new(store()), load_pipeline(&cfg)?, &cfg);
            print_json(&runtime.block_on(verifier.verify(&account, &live))?)
        }
        Commands::VerifySignature { account, image } => {
            let upload = read_upload(&image, &normalizer)?;
            let verifier = SignatureVerifier::new(Arc::new(store()), &cfg);
            print_json(&runtime.block_on(verifier.verify(&account, &upload))?)
        }
        Commands::Enroll {
            account,
            kind,
            source_id,
            image,
        } => {
            let upload = read_upload(&image, &normalizer)?;
            let kind = ReferenceKind::from(kind);
            let mut enroller = Enroller::new(store(), &cfg);
            if kind == ReferenceKind::Face {
                enroller = enroller.with_embedder(load_pipeline(&cfg)?);
            }
            let id = enroller.enroll(&account, kind, upload, source_id)?;
            info!("✓ Reference {} enrolled for account {}", id, account);
            Ok(())
        }
        Commands::List { account } => print_json(&Enroller::new(store(), &cfg).summary(&account)?),
        Commands::RequireSignatures { account, count } => {
            Enroller::new(store(), &cfg).set_required_signatures(&account, count)
        }
        Commands::Purge { account } => Enroller::new(store(), &cfg).purge(&account),
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

/// Models load once up front; no request is served without them.
fn load_pipeline(cfg: &Config) -> Result<Arc<dyn FaceEmbedder>> {
    let pipeline = Pipeline::new(&cfg.models.detector, &cfg.models.recognizer)
        .context("Failed to initialize face recognition pipeline")?
        .with_nms_threshold(cfg.detection.nms_threshold);
    Ok(Arc::new(pipeline))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {}", config_path.display());

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
