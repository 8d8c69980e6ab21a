use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::Source;
use harvest_engine::HarvestConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Listing post harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest registered sources into a CSV report.
    Harvest {
        /// Source id to harvest; repeat for several. Defaults to every registered source.
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Posts to keep per source.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Report path; defaults to `<reports dir>/<run id>.csv`.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Serve the harvest form.
    Serve,
    #[command(subcommand)]
    Sources(SourcesCommand),
}

#[derive(Debug, Subcommand)]
enum SourcesCommand {
    List,
    /// Register a source, or rename an existing one.
    Add { id: String, display_name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Harvest {
            sources,
            limit,
            out,
        } => {
            let summary = harvest_engine::run_harvest_once_from_env(&sources, limit, out).await?;
            println!(
                "harvest complete: run_id={} sources={} posts={} ok={} partial={} failed={} newest={} report={}",
                summary.run_id,
                summary.sources,
                summary.posts,
                summary.counts.ok,
                summary.counts.partial,
                summary.counts.failed,
                summary.newest_post.as_deref().unwrap_or("n/a"),
                summary.report_path
            );
        }
        Commands::Serve => harvest_web::serve_from_env().await?,
        Commands::Sources(SourcesCommand::List) => {
            let registry = HarvestConfig::from_env().registry();
            let sources = registry
                .load()
                .await
                .with_context(|| format!("loading {}", registry.path().display()))?;
            for source in &sources {
                println!("{}\t{}", source.id, source.display_name);
            }
            if sources.is_empty() {
                eprintln!("no sources registered in {}", registry.path().display());
            }
        }
        Commands::Sources(SourcesCommand::Add { id, display_name }) => {
            let registry = HarvestConfig::from_env().registry();
            let sources = registry.add(Source::new(id, display_name)).await?;
            println!(
                "registered: {} sources in {}",
                sources.len(),
                registry.path().display()
            );
        }
    }

    Ok(())
}
