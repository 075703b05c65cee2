use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::fs;

/// HealOps: automated recovery from CI pipeline failures
#[derive(Parser, Debug)]
#[command(name = "healops")]
#[command(about = "Operator CLI for the HealOps service", long_about = None)]
struct Cli {
    /// Base URL of the HealOps server
    #[arg(long, default_value = "http://localhost:3000", global = true)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a CI failure webhook
    Ingest(IngestArgs),
    /// Apply a human action to a run (approve, deny, abort, human-fix)
    Action(ActionArgs),
    /// List runs
    Runs(RunsArgs),
    /// Show aggregate summary counts
    Summary,
    /// Tail the live event stream
    Watch(WatchArgs),
}

#[derive(Parser, Debug)]
struct IngestArgs {
    /// CI provider name
    #[arg(long, default_value = "github-actions")]
    provider: String,

    /// Repository in owner/name form
    #[arg(long)]
    repository: String,

    #[arg(long, default_value = "main")]
    branch: String,

    /// Failing commit SHA
    #[arg(long)]
    commit: String,

    #[arg(long)]
    pipeline_url: Option<String>,

    /// Error classification (e.g. type_error, build_error)
    #[arg(long)]
    error_type: Option<String>,

    /// Path to the raw error log file; use '-' for stdin
    #[arg(long)]
    log_file: String,

    /// Webhook signing secret; when set the signature header is computed
    #[arg(long)]
    secret: Option<String>,
}

#[derive(Parser, Debug)]
struct ActionArgs {
    /// Run id
    run_id: String,

    /// One of: approve, deny, abort, human-fix
    action: String,

    /// Optional reviewer note
    #[arg(long)]
    note: Option<String>,
}

#[derive(Parser, Debug)]
struct RunsArgs {
    /// Filter by status (queued, running, fixed, escalated, aborted, resolved)
    #[arg(long)]
    status: Option<String>,

    /// Filter by repository
    #[arg(long)]
    repository: Option<String>,

    #[arg(long, default_value_t = 1)]
    page: usize,
}

#[derive(Parser, Debug)]
struct WatchArgs {
    /// Only show events for this run
    #[arg(long)]
    run_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Ingest(args) => ingest(&client, &cli.server, args).await,
        Commands::Action(args) => action(&client, &cli.server, args).await,
        Commands::Runs(args) => runs(&client, &cli.server, args).await,
        Commands::Summary => summary(&client, &cli.server).await,
        Commands::Watch(args) => watch(&client, &cli.server, args).await,
    }
}

fn read_log(path: &str) -> Result<String> {
    if path == "-" {
        let mut buffer = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buffer)
            .context("Failed to read error log from stdin")?;
        Ok(buffer)
    } else {
        fs::read_to_string(path).with_context(|| format!("Failed to read log file {path}"))
    }
}

fn sign(secret: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

async fn print_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let text = response.text().await.context("Failed to read response")?;

    let pretty = serde_json::from_str::<serde_json::Value>(&text)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or(text);
    println!("{pretty}");

    if !status.is_success() {
        return Err(anyhow!("server returned {}", status));
    }
    Ok(())
}

async fn ingest(client: &reqwest::Client, server: &str, args: IngestArgs) -> Result<()> {
    let error_log = read_log(&args.log_file)?;

    let body = serde_json::json!({
        "provider": args.provider,
        "repository": args.repository,
        "branch": args.branch,
        "commitSha": args.commit,
        "pipelineUrl": args.pipeline_url,
        "errorType": args.error_type,
        "errorLog": error_log,
    });

    let mut request = client.post(format!("{server}/webhooks/ci")).json(&body);
    if let Some(secret) = &args.secret {
        request = request.header("x-healops-signature", sign(secret, &error_log));
    }

    let response = request.send().await.context("Failed to send webhook")?;
    print_response(response).await
}

async fn action(client: &reqwest::Client, server: &str, args: ActionArgs) -> Result<()> {
    let response = client
        .post(format!(
            "{server}/runs/{}/actions/{}",
            args.run_id, args.action
        ))
        .json(&serde_json::json!({ "note": args.note }))
        .send()
        .await
        .context("Failed to send action")?;
    print_response(response).await
}

async fn runs(client: &reqwest::Client, server: &str, args: RunsArgs) -> Result<()> {
    let mut query: Vec<(&str, String)> = vec![("page", args.page.to_string())];
    if let Some(status) = args.status {
        query.push(("status", status));
    }
    if let Some(repository) = args.repository {
        query.push(("repository", repository));
    }

    let response = client
        .get(format!("{server}/runs"))
        .query(&query)
        .send()
        .await
        .context("Failed to list runs")?;
    print_response(response).await
}

async fn summary(client: &reqwest::Client, server: &str) -> Result<()> {
    let response = client
        .get(format!("{server}/metrics/summary"))
        .send()
        .await
        .context("Failed to fetch summary")?;
    print_response(response).await
}

async fn watch(client: &reqwest::Client, server: &str, args: WatchArgs) -> Result<()> {
    let mut request = client.get(format!("{server}/stream"));
    if let Some(run_id) = &args.run_id {
        request = request.query(&[("runId", run_id)]);
    }

    let response = request.send().await.context("Failed to open stream")?;
    if !response.status().is_success() {
        return Err(anyhow!("server returned {}", response.status()));
    }

    eprintln!("Connected; streaming events (Ctrl-C to stop)");
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Stream read failed")?;
        print!("{}", String::from_utf8_lossy(&chunk));
    }
    Ok(())
}
