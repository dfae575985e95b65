use std::{fs, io, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use slackpaper::config::{DEFAULT_API_BASE, DEFAULT_DOMAIN, SyncConfig};
use slackpaper::core::Reference;
use slackpaper::pipeline::prepare_message;
use slackpaper::sink::SlackSink;
use slackpaper::sync::Syncer;
use slackpaper::watch::DocumentWatcher;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "slackpaper",
    about = "Mirror a bookmarked TaskPaper section into a Slack message",
    version
)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides this).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(flatten)]
    slack: SlackArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct SlackArgs {
    /// Slack API token allowed to call chat.update.
    #[arg(long, env = "SLACK_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Workspace subdomain used in printed links (`acme` for acme.slack.com).
    #[arg(long, env = "SLACK_SUBDOMAIN")]
    subdomain: Option<String>,
    /// Service domain used in printed links.
    #[arg(long, env = "SLACK_DOMAIN", default_value = DEFAULT_DOMAIN)]
    domain: String,
    /// Base URL of the Slack Web API.
    #[arg(long, env = "SLACK_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch a TaskPaper file and update the bookmarked message on every save.
    Watch(DocumentArgs),

    /// Run a single sync cycle and exit.
    Push(DocumentArgs),

    /// Print the reference and rendered message without contacting Slack.
    Render(RenderArgs),
}

#[derive(Debug, Args)]
struct DocumentArgs {
    /// TaskPaper document containing an `@slack(channel/timestamp)` header.
    document: PathBuf,
}

#[derive(Debug, Args)]
struct RenderArgs {
    /// TaskPaper document containing an `@slack(channel/timestamp)` header.
    document: PathBuf,
    /// Emit JSON instead of the message text.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Watch(args) => handle_watch(cli.slack, args).await,
        Commands::Push(args) => handle_push(cli.slack, args).await,
        Commands::Render(args) => handle_render(args),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn build_config(slack: SlackArgs, document: PathBuf) -> Result<SyncConfig> {
    let SlackArgs {
        token,
        subdomain,
        domain,
        api_base,
    } = slack;
    SyncConfig::new(token, subdomain, domain, api_base, document).context("invalid configuration")
}

async fn handle_watch(slack: SlackArgs, args: DocumentArgs) -> Result<()> {
    let config = build_config(slack, args.document)?;
    let watcher = DocumentWatcher::new(&config.document).context("setting up document watch")?;
    let sink = SlackSink::new(&config);
    let worker = tokio::spawn(Syncer::new(config, sink).run(watcher));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");
    worker.abort();
    Ok(())
}

async fn handle_push(slack: SlackArgs, args: DocumentArgs) -> Result<()> {
    let config = build_config(slack, args.document)?;
    let sink = SlackSink::new(&config);
    let report = Syncer::new(config, sink)
        .sync_once()
        .await
        .context("syncing document")?;
    println!("Updated: {}", report.permalink);
    Ok(())
}

fn handle_render(args: RenderArgs) -> Result<()> {
    let RenderArgs { document, json } = args;
    let text = fs::read_to_string(&document).with_context(|| format!("reading {:?}", document))?;
    let prepared =
        prepare_message(&text).with_context(|| format!("locating bookmark in {:?}", document))?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            reference: &'a Reference,
            posted_at: Option<String>,
            text: String,
        }

        let payload = JsonOutput {
            reference: &prepared.reference,
            posted_at: prepared.reference.posted_at().map(|t| t.to_rfc3339()),
            text: prepared.message.text(),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        let Reference {
            channel, timestamp, ..
        } = &prepared.reference;
        match prepared.reference.posted_at() {
            Some(posted) => eprintln!("channel {channel}, ts {timestamp} (posted {posted})"),
            None => eprintln!("channel {channel}, ts {timestamp}"),
        }
        println!("{}", prepared.message.text());
    }
    Ok(())
}
