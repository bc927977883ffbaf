use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use roster_reconcile::{
    connect, run_audit, run_fix, write_report, AuditOptions, FixCategory, FixOptions,
    ReconcileConfig, RunMode,
};
use roster_storage::RecordStore;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "roster-cli")]
#[command(about = "Audit and repair organization membership records")]
struct Cli {
    /// Service-account key file.
    #[arg(long, global = true)]
    credentials: Option<PathBuf>,
    #[arg(long, global = true)]
    project: Option<String>,
    /// Primary membership collection.
    #[arg(long, global = true)]
    collection: Option<String>,
    /// Also write the report as JSON under <DIR>/<run_id>/.
    #[arg(long, global = true)]
    report_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Report anomalies without writing anything.
    Audit {
        /// Examples shown per category.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Repair the selected categories. Dry run unless --apply.
    Fix(FixArgs),
}

#[derive(Debug, Args)]
struct FixArgs {
    /// Write changes instead of only listing them.
    #[arg(long)]
    apply: bool,
    #[arg(long)]
    roles: bool,
    #[arg(long)]
    timestamps: bool,
    #[arg(long)]
    viewer_permissions: bool,
    #[arg(long)]
    mirrors: bool,
    #[arg(long)]
    dedupe_emails: bool,
    /// Every category.
    #[arg(long)]
    all: bool,
}

impl FixArgs {
    fn categories(&self) -> Vec<FixCategory> {
        if self.all {
            return FixCategory::ALL.to_vec();
        }
        [
            (self.roles, FixCategory::Roles),
            (self.timestamps, FixCategory::Timestamps),
            (self.viewer_permissions, FixCategory::ViewerPermissions),
            (self.dedupe_emails, FixCategory::DedupeEmails),
            (self.mirrors, FixCategory::Mirrors),
        ]
        .into_iter()
        .filter_map(|(enabled, category)| enabled.then_some(category))
        .collect()
    }
}

const FIX_GUIDANCE: &str = "No fix category selected. Choose one or more of:
  --roles               replace the legacy \"member\" role with technician
  --timestamps          fill missing createdAt/updatedAt
  --viewer-permissions  clear viewerPermissions on non-viewers
  --dedupe-emails       deactivate duplicate memberships per organization
  --mirrors             create or correct organization member mirrors
                        (a mirror whose lookup fails is skipped; re-run audit)
  --all                 everything above
Runs are dry runs until --apply is given.";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!(
        engine = roster_reconcile::CRATE_NAME,
        version = env!("CARGO_PKG_VERSION"),
        "starting membership reconciliation"
    );

    match cli.command.as_ref().unwrap_or(&Commands::Audit { limit: None }) {
        Commands::Audit { limit } => {
            let config = load_config(&cli)?;
            let store = connect(&config).await?;
            let options = AuditOptions {
                example_limit: limit.unwrap_or(config.example_limit),
            };
            let report = run_audit(&store, &options).await?;
            println!("{}", report.render());
            if let Some(dir) = &config.report_dir {
                let path = write_report(dir, report.run_id, "audit.json", &report).await?;
                info!(path = %path.display(), "wrote audit report");
            }
        }
        Commands::Fix(args) => {
            let categories = args.categories();
            if categories.is_empty() {
                println!("{FIX_GUIDANCE}");
                return Ok(());
            }
            let config = load_config(&cli)?;
            let store = connect(&config).await?;
            let mode = if args.apply { RunMode::Apply } else { RunMode::DryRun };
            let options = FixOptions {
                batch_ceiling: config.effective_batch_ceiling(),
                ..FixOptions::new(mode, categories)
            };
            info!(store = %store.describe(), %mode, "starting fix");
            let report = run_fix(&store, &options).await?;
            println!("{}", report.render());
            if let Some(dir) = &config.report_dir {
                let path = write_report(dir, report.run_id, "fix.json", &report).await?;
                info!(path = %path.display(), "wrote fix report");
            }
        }
    }

    Ok(())
}

/// File and environment settings, then command-line flags on top.
fn load_config(cli: &Cli) -> Result<ReconcileConfig> {
    let root = std::env::current_dir().context("resolving working directory")?;
    let mut config = ReconcileConfig::load(&root).context("loading roster configuration")?;
    if let Some(path) = &cli.credentials {
        config.credentials_path = path.clone();
    }
    if let Some(project) = &cli.project {
        config.project_id = Some(project.clone());
    }
    if let Some(collection) = &cli.collection {
        config.collection = collection.clone();
    }
    if let Some(dir) = &cli.report_dir {
        config.report_dir = Some(dir.clone());
    }
    Ok(config)
}
