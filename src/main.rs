use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ha_config_optimizer::adapters::{supported_vendors, ProviderFactory, ProviderProfile};
use ha_config_optimizer::config::Config;
use ha_config_optimizer::core::{apply_suggestion, AnalysisKind, ScanOrchestrator, SuggestionStatus};
use ha_config_optimizer::services::{
    AesSecretStore, JsonStore, LocalFileStore, LogSink, NotificationSink, NullSink, SecretStore,
    Store,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ha-optimizer")]
#[command(about = "LLM-driven optimization and automation suggestions for Home Assistant configuration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Config file (skips discovery)")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a scan to completion and print its suggestions as JSON")]
    Scan {
        #[arg(long, help = "Provider profile id (defaults to the first active profile)")]
        profile: Option<i64>,

        #[arg(long = "kind", help = "optimization or automation; repeatable")]
        kinds: Vec<AnalysisKind>,

        #[arg(long, help = "Do not log scan progress events")]
        quiet: bool,

        #[arg(help = "Files relative to the config root (defaults to the include/exclude patterns)")]
        files: Vec<String>,
    },
    #[command(about = "Print the static vendor registry")]
    Providers,
    Models {
        #[arg(long)]
        profile: Option<i64>,
    },
    #[command(about = "Probe a provider profile")]
    Test {
        #[arg(long)]
        profile: Option<i64>,
    },
    #[command(about = "List the files a scan would analyze")]
    Files,
    Suggestions {
        #[command(subcommand)]
        command: SuggestionCommands,
    },
    Scans {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Secret {
        #[command(subcommand)]
        command: SecretCommands,
    },
}

#[derive(Subcommand)]
enum SuggestionCommands {
    List {
        #[arg(long)]
        scan: Option<i64>,
    },
    Show {
        id: i64,
    },
    Accept {
        id: i64,
    },
    Reject {
        id: i64,
    },
    #[command(about = "Write an accepted suggestion back to its file")]
    Apply {
        id: i64,
    },
}

#[derive(Subcommand)]
enum SecretCommands {
    Encrypt { value: String },
}

struct App {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    files: Arc<LocalFileStore>,
    secrets: Arc<dyn SecretStore>,
    factory: Arc<ProviderFactory>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    config.apply_env();

    let app = build_app(config).await?;

    match cli.command {
        Commands::Scan {
            profile,
            kinds,
            quiet,
            files,
        } => scan_command(&app, profile, kinds, quiet, files).await?,
        Commands::Providers => {
            println!("{}", serde_json::to_string_pretty(supported_vendors())?);
        }
        Commands::Models { profile } => models_command(&app, profile).await?,
        Commands::Test { profile } => test_command(&app, profile).await?,
        Commands::Files => files_command(&app).await?,
        Commands::Suggestions { command } => suggestions_command(&app, command).await?,
        Commands::Scans { limit } => {
            let scans = app.store.list_scans(limit).await?;
            println!("{}", serde_json::to_string_pretty(&scans)?);
        }
        Commands::Secret {
            command: SecretCommands::Encrypt { value },
        } => {
            println!("{}", app.secrets.encrypt(&value)?);
        }
    }

    Ok(())
}

async fn build_app(config: Config) -> Result<App> {
    let secrets: Arc<dyn SecretStore> =
        Arc::new(AesSecretStore::new(config.encryption_key.as_deref()));

    let data_file = config.data_file.clone().or_else(|| {
        dirs::data_local_dir().map(|dir| dir.join("ha-optimizer").join("store.json"))
    });
    let store: Arc<dyn Store> = match data_file {
        Some(path) => {
            info!("Using data file {}", path.display());
            Arc::new(
                JsonStore::open(&path)
                    .await
                    .with_context(|| format!("opening data file {}", path.display()))?,
            )
        }
        None => Arc::new(JsonStore::in_memory()),
    };

    seed_profiles(&config, store.as_ref(), secrets.as_ref()).await?;

    let config = Arc::new(config);
    let files = Arc::new(LocalFileStore::new(&config.config_path));
    let factory = Arc::new(ProviderFactory::new(config.clone(), secrets.clone()));
    Ok(App {
        config,
        store,
        files,
        secrets,
        factory,
    })
}

/// Profiles declared in the config file are upserted by name, with their
/// credentials encrypted before they reach the store.
async fn seed_profiles(config: &Config, store: &dyn Store, secrets: &dyn SecretStore) -> Result<()> {
    for profile in &config.profiles {
        let mut profile = profile.clone();
        if let Some(key) = profile.api_key.as_deref() {
            if !secrets.is_ciphertext(key) {
                profile.api_key = Some(secrets.encrypt(key)?);
            }
        }
        let stored = store.upsert_profile(profile).await?;
        info!("Loaded provider profile '{}' as id {}", stored.name, stored.id);
    }
    Ok(())
}

async fn resolve_profile(app: &App, id: Option<i64>) -> Result<ProviderProfile> {
    match id {
        Some(id) => Ok(app.store.get_profile(id).await?),
        None => app
            .store
            .first_active_profile()
            .await?
            .context("no active provider profile; declare one under `profiles` in the config file"),
    }
}

fn orchestrator(app: &App, sink: Arc<dyn NotificationSink>) -> ScanOrchestrator {
    ScanOrchestrator::new(
        app.config.clone(),
        app.store.clone(),
        app.files.clone(),
        app.factory.clone(),
        sink,
    )
}

async fn scan_command(
    app: &App,
    profile: Option<i64>,
    kinds: Vec<AnalysisKind>,
    quiet: bool,
    files: Vec<String>,
) -> Result<()> {
    let sink: Arc<dyn NotificationSink> = if quiet {
        Arc::new(NullSink)
    } else {
        Arc::new(LogSink)
    };
    let orchestrator = orchestrator(app, sink);

    let scan = orchestrator.create_scan(profile).await?;
    let subset = if files.is_empty() { None } else { Some(files) };
    let scan = orchestrator.start(scan.id, subset, &kinds).await?;
    let suggestions = app.store.load_suggestions(scan.id).await?;

    let report = serde_json::json!({
        "scan": scan,
        "suggestions": suggestions,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn models_command(app: &App, profile: Option<i64>) -> Result<()> {
    let profile = resolve_profile(app, profile).await?;
    let adapter = app.factory.create(&profile)?;
    for model in adapter.list_models().await {
        println!("{}", model);
    }
    Ok(())
}

async fn test_command(app: &App, profile: Option<i64>) -> Result<()> {
    let profile = resolve_profile(app, profile).await?;
    let adapter = app.factory.create(&profile)?;
    let (ok, diagnostic) = adapter.test_connection().await;
    if !ok {
        anyhow::bail!("{} ({}): {}", profile.name, adapter.vendor(), diagnostic);
    }
    println!("{} ({}): {}", profile.name, adapter.vendor(), diagnostic);
    Ok(())
}

async fn files_command(app: &App) -> Result<()> {
    for path in orchestrator(app, Arc::new(NullSink)).resolve_files(None).await? {
        println!("{}", path);
    }
    Ok(())
}

async fn suggestions_command(app: &App, command: SuggestionCommands) -> Result<()> {
    match command {
        SuggestionCommands::List { scan } => {
            let suggestions = match scan {
                Some(scan_id) => app.store.load_suggestions(scan_id).await?,
                None => app.store.list_suggestions().await?,
            };
            for s in suggestions {
                println!(
                    "{:>5}  {:<9} {:<7} {:<13} {}",
                    s.id,
                    s.status.as_str(),
                    s.impact.as_str(),
                    s.kind().as_str(),
                    s.title
                );
            }
        }
        SuggestionCommands::Show { id } => {
            let record = app.store.get_suggestion(id).await?;
            println!("# {}\n", record.title);
            println!("{}", record.body_md);
            if let Some(diff) = record.unified_diff() {
                println!("\n{}", diff);
            }
        }
        SuggestionCommands::Accept { id } => {
            let record = app.store.update_status(id, SuggestionStatus::Accepted).await?;
            println!("Suggestion {} is {}", record.id, record.status);
        }
        SuggestionCommands::Reject { id } => {
            let record = app.store.update_status(id, SuggestionStatus::Rejected).await?;
            println!("Suggestion {} is {}", record.id, record.status);
        }
        SuggestionCommands::Apply { id } => {
            let mut record = app.store.get_suggestion(id).await?;
            apply_suggestion(&mut record, app.files.as_ref()).await?;
            app.store.update_suggestion(&record).await?;
            println!("Suggestion {} is {}", record.id, record.status);
        }
    }
    Ok(())
}
