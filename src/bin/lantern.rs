//! Lantern CLI: operator commands for the ritual-text curation pipeline.
//!
//! Usage:
//!   lantern worker [--once] [--db path] [--config path]
//!   lantern register <path> [--format md]
//!   lantern decide passage <id> approve --reviewer alice
//!   lantern tuning create strict.yaml --default

use clap::{Parser, Subcommand};
use lantern::api::ApiResult;
use lantern::capability::FsSourceReader;
use lantern::dedup::SourceInput;
use lantern::model::{ProfileDraft, RegisterOutcome, ReprocessTriggerMode, ReviewDecisionKind, ReviewableType};
use lantern::review::DEFAULT_PAGE_SIZE;
use lantern::{CancellationToken, Capabilities, CurationApi, OpenStore, PipelineConfig, SqliteStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "lantern",
    version,
    about = "Curation pipeline for multilingual ritual texts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Path to a YAML pipeline configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory that relative source locators resolve against
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Actor recorded on audit events (defaults to the configured operator)
    #[arg(long, global = true)]
    actor: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process ingestion and reprocess jobs
    Worker {
        /// Drain the queues once instead of polling until interrupted
        #[arg(long)]
        once: bool,
    },
    /// Register a source file
    Register {
        #[arg(required = true)]
        path: PathBuf,
        /// Format hint (defaults to the file extension)
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        region: Option<String>,
        /// Tradition tag, repeatable
        #[arg(long = "tradition")]
        traditions: Vec<String>,
        /// Enqueue an ingestion job for a newly registered source
        #[arg(long)]
        enqueue: bool,
    },
    /// Enqueue an ingestion job for a source
    Enqueue {
        source_id: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Requeue dead-lettered ingestion jobs
    RequeueDeadLetter {
        /// Job to requeue; omit with --all
        job_id: Option<String>,
        #[arg(long, conflicts_with = "job_id")]
        all: bool,
        #[arg(long)]
        reason: String,
    },
    /// Queue a manual reprocess of a passage
    Reprocess {
        passage_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show quality and reprocess state of a passage
    Quality { passage_id: String },
    /// Record a review decision
    Decide {
        object_type: ReviewableType,
        object_id: String,
        decision: ReviewDecisionKind,
        #[arg(long)]
        reviewer: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List objects awaiting review
    Queue {
        object_type: ReviewableType,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },
    /// Consolidate the passages of a witness group
    Consolidate { group_id: String },
    /// Publish an approved object
    Publish {
        object_type: ReviewableType,
        object_id: String,
    },
    /// Print the audit trail of an object
    Audit { object_id: String },
    /// Print any record by id
    Show { id: String },
    /// Return reprocess jobs whose claim has outlived the job timeout
    SweepReprocess,
    /// Manage extraction tuning profiles
    Tuning {
        #[command(subcommand)]
        command: TuningCommands,
    },
}

#[derive(Subcommand)]
enum TuningCommands {
    /// List all profiles, oldest first
    List,
    /// Show the default profile and the settings it yields
    Active,
    /// Create a profile from a YAML draft
    Create {
        path: PathBuf,
        /// Make the new profile the default
        #[arg(long)]
        default: bool,
    },
    /// Replace a profile's content from a YAML draft
    Update { profile_id: String, path: PathBuf },
    /// Make a profile the default
    SetDefault { profile_id: String },
}

/// Get the default database path (~/.local/share/lantern/lantern.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let lantern_dir = data_dir.join("lantern");
    std::fs::create_dir_all(&lantern_dir).ok();
    lantern_dir.join("lantern.db")
}

fn open_api(cli: &Cli) -> Result<CurationApi, String> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path).map_err(|e| format!("Failed to load config: {}", e))?,
        None => PipelineConfig::default(),
    };
    let db_path = cli.db.clone().unwrap_or_else(default_db_path);
    let store = SqliteStore::open(&db_path).map_err(|e| format!("Failed to open database: {}", e))?;
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().map_err(|e| format!("Failed to resolve working directory: {}", e))?,
    };
    let capabilities = Capabilities::heuristic(Arc::new(FsSourceReader::new(root)));
    Ok(CurationApi::new(Arc::new(store), capabilities, config))
}

fn print_result<T: Serialize>(result: ApiResult<T>) -> i32 {
    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(json) => {
                println!("{}", json);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Err(report) => {
            eprintln!("Error: {}", report);
            1
        }
    }
}

async fn cmd_worker(api: &CurationApi, once: bool) -> i32 {
    let worker = api.worker();
    if once {
        return match worker.run_until_idle().await {
            Ok(cycles) => {
                println!("Processed {} cycle(s)", cycles);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        };
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping worker");
            on_signal.cancel();
        }
    });
    match worker.run(&cancel).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn format_from_path(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("txt")
        .to_string()
}

#[allow(clippy::too_many_arguments)]
async fn cmd_register(
    api: &CurationApi,
    actor: &str,
    path: &Path,
    format: Option<String>,
    title: Option<String>,
    region: Option<String>,
    traditions: Vec<String>,
    enqueue: bool,
) -> i32 {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error: failed to read {}: {}", path.display(), e);
            return 1;
        }
    };
    let format = format.unwrap_or_else(|| format_from_path(path));
    let mut input = SourceInput::new(path.to_string_lossy(), format, bytes).with_traditions(traditions);
    if let Some(title) = title {
        input = input.with_title(title);
    }
    if let Some(region) = region {
        input = input.with_region(region);
    }

    let registration = match api.register_source(&input, actor).await {
        Ok(registration) => registration,
        Err(report) => {
            eprintln!("Error: {}", report);
            return 1;
        }
    };
    println!(
        "{} {} (text {})",
        registration.outcome, registration.source.source_id, registration.source.text_id
    );
    if enqueue && registration.outcome != RegisterOutcome::ExactDuplicate {
        return match api.enqueue_job(registration.source.source_id.as_str(), None, actor) {
            Ok(job) => {
                println!("Enqueued job {}", job.job_id);
                0
            }
            Err(report) => {
                eprintln!("Error: {}", report);
                1
            }
        };
    }
    0
}

fn cmd_requeue_dead_letter(api: &CurationApi, actor: &str, job_id: Option<String>, all: bool, reason: &str) -> i32 {
    if job_id.is_none() && !all {
        eprintln!("Error: pass a job id or --all");
        return 2;
    }
    match api.requeue_dead_letter(job_id.as_deref(), reason, actor) {
        Ok(jobs) => {
            for job in &jobs {
                println!("Requeued {}", job.job_id);
            }
            println!("{} job(s) requeued", jobs.len());
            0
        }
        Err(report) => {
            eprintln!("Error: {}", report);
            1
        }
    }
}

fn read_draft(path: &Path) -> Result<ProfileDraft, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    serde_yaml::from_str(&text).map_err(|e| format!("invalid profile draft {}: {}", path.display(), e))
}

#[derive(Serialize)]
struct ActiveProfile {
    profile: lantern::model::TuningProfile,
    settings: lantern::quality::QualitySettings,
}

fn cmd_tuning(api: &CurationApi, actor: &str, command: TuningCommands) -> i32 {
    match command {
        TuningCommands::List => print_result(api.list_profiles()),
        TuningCommands::Active => print_result(api.default_profile(actor).and_then(|profile| {
            Ok(ActiveProfile {
                profile,
                settings: api.active_settings()?,
            })
        })),
        TuningCommands::Create { path, default } => match read_draft(&path) {
            Ok(draft) => print_result(api.create_profile(&draft, default, actor)),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        TuningCommands::Update { profile_id, path } => match read_draft(&path) {
            Ok(draft) => print_result(api.update_profile(&profile_id, &draft, actor)),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        TuningCommands::SetDefault { profile_id } => print_result(api.set_default_profile(&profile_id, actor)),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = match open_api(&cli) {
        Ok(api) => api,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let actor = cli.actor.clone().unwrap_or_else(|| api.config().operator_id.clone());

    let code = match cli.command {
        Commands::Worker { once } => cmd_worker(&api, once).await,
        Commands::Register {
            path,
            format,
            title,
            region,
            traditions,
            enqueue,
        } => cmd_register(&api, &actor, &path, format, title, region, traditions, enqueue).await,
        Commands::Enqueue { source_id, key } => print_result(api.enqueue_job(&source_id, key.as_deref(), &actor)),
        Commands::RequeueDeadLetter { job_id, all, reason } => {
            cmd_requeue_dead_letter(&api, &actor, job_id, all, &reason)
        }
        Commands::Reprocess {
            passage_id,
            reason,
            notes,
        } => print_result(api.requeue_passage(
            &passage_id,
            ReprocessTriggerMode::Manual,
            &reason,
            notes.as_deref(),
            &actor,
        )),
        Commands::Quality { passage_id } => print_result(api.quality_summary(&passage_id)),
        Commands::Decide {
            object_type,
            object_id,
            decision,
            reviewer,
            notes,
        } => print_result(api.decide(object_type, &object_id, decision, &reviewer, notes.as_deref())),
        Commands::Queue {
            object_type,
            page,
            page_size,
        } => print_result(api.review_queue(object_type, page, page_size)),
        Commands::Consolidate { group_id } => print_result(api.consolidate(&group_id, &actor)),
        Commands::Publish { object_type, object_id } => print_result(api.publish(object_type, &object_id, &actor)),
        Commands::Audit { object_id } => print_result(api.audit_trail(&object_id)),
        Commands::Show { id } => print_result(api.lookup(&id)),
        Commands::SweepReprocess => print_result(api.sweep_stale_reprocess(&actor)),
        Commands::Tuning { command } => cmd_tuning(&api, &actor, command),
    };
    std::process::exit(code);
}
