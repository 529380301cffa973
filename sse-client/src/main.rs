use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use sse_client::client::{
    ClientOptions, EventSourceClient, EventSourceHandlers, StaticTokenProvider,
};
use sse_client::error::Error;
use sse_client::parser::SseEvent;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sse-listen")]
#[command(about = "Subscribe to a REST server's SSE stream and print every event")]
struct Cli {
    /// SSE endpoint (e.g., http://localhost:5678/restsse/)
    url: String,

    /// Comma-separated subjects to subscribe to (default: all)
    #[arg(long, short)]
    subjects: Option<String>,

    /// Resume after this event id
    #[arg(long)]
    last_event_id: Option<String>,

    /// Seconds to wait before reconnecting
    #[arg(long, default_value_t = 10)]
    retry_secs: u64,

    /// Bearer token sent with each connection attempt
    #[arg(long, env = "SSE_LISTEN_TOKEN")]
    token: Option<String>,

    /// Accept self-signed server certificates
    #[arg(long)]
    insecure: bool,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

struct ConsolePrinter;

impl EventSourceHandlers for ConsolePrinter {
    fn on_connecting(&self) {
        println!("{} Connecting...", "→".blue());
    }

    fn on_open(&self) {
        println!("{} Stream open", "✓".green());
    }

    fn on_message(&self, event: &SseEvent) {
        let data = serde_json::from_str::<serde_json::Value>(&event.data)
            .and_then(|value| serde_json::to_string_pretty(&value))
            .unwrap_or_else(|_| event.data.clone());
        println!(
            "{} {} {}\n{}",
            "●".bright_cyan(),
            event.event.bright_white().bold(),
            event
                .id
                .as_deref()
                .map(|id| format!("(id {id})"))
                .unwrap_or_default()
                .dimmed(),
            data
        );
    }

    fn on_error(&self, error: &Error) {
        eprintln!("{} {}", "✗".red(), error);
    }

    fn on_closed(&self) {
        println!("{} Stream closed", "■".yellow());
    }
}

fn subscription_url(url: &str, subjects: Option<&str>) -> Result<String> {
    let mut url = reqwest::Url::parse(url).with_context(|| format!("Invalid URL '{url}'"))?;
    if let Some(subjects) = subjects {
        url.query_pairs_mut().append_pair("subjects", subjects);
    }
    Ok(url.into())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    let url = subscription_url(&cli.url, cli.subjects.as_deref())?;
    println!("{} Listening on {}", "→".blue(), url.bright_white());

    let mut client = EventSourceClient::new(
        url,
        Arc::new(ConsolePrinter),
        ClientOptions {
            retry_delay: Duration::from_secs(cli.retry_secs),
            last_event_id: cli.last_event_id,
            accept_invalid_certs: cli.insecure,
        },
    );
    if let Some(token) = cli.token {
        client = client.with_token_provider(Arc::new(StaticTokenProvider(token)));
    }
    let client = Arc::new(client);

    let mut runner = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };

    tokio::select! {
        finished = &mut runner => finished??,
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            client.stop();
            runner.await??;
        }
    }
    Ok(())
}
