use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use lmgate_core::{
    config::Config,
    http_client::{HttpClient, RequestCtx},
    model::{ChatCompletionBody, ChatMessage, CompletionRequest},
    provider::ChatProvider,
    providers::{Dummy, LmStudio},
    server::{serve, AppState},
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Chat completion gateway for local LLM servers", long_about = None)]
struct Cli {
    /// Config file (.json or .toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway in front of an OpenAI-compatible backend
    Serve {
        #[arg(long, help = "Listen address, e.g. 0.0.0.0:8000")]
        bind: Option<String>,
        #[arg(long, help = "Backend base URL including /v1")]
        upstream: Option<String>,
        #[arg(long, help = "Default model when requests omit one")]
        model: Option<String>,
    },
    /// Run the gateway with the canned poem backend
    Dummy {
        #[arg(long, default_value = "0.0.0.0:8001")]
        bind: String,
        #[arg(long)]
        chunk_delay_ms: Option<u64>,
    },
    /// Send one chat completion and print the reply
    Chat {
        #[arg(long, help = "Base URL of a gateway or backend")]
        base: Option<String>,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
    /// Stream a chat completion (prints deltas live)
    ChatStream {
        #[arg(long, help = "Base URL of a gateway or backend")]
        base: Option<String>,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
    /// Probe a gateway or backend
    Health {
        #[arg(long)]
        base: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let cfg = match path {
        Some(p) => Config::from_path(p)
            .with_context(|| format!("loading config from {}", p.display()))?,
        None => Config::default(),
    };
    Ok(cfg.with_env_overrides())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    info!("ctrl-c received, draining connections");
}

async fn run_gateway(bind: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    serve(listener, state, shutdown_signal()).await?;
    Ok(())
}

fn client_provider(cfg: &Config, base: Option<String>) -> anyhow::Result<LmStudio> {
    let mut upstream = cfg.upstream.clone();
    if let Some(b) = base {
        upstream.base_url = b;
    }
    let http = HttpClient::from_cfg(&cfg.http)?;
    Ok(LmStudio::from_cfg(http, &upstream))
}

fn one_message(cfg: &Config, message: String, stream: bool) -> anyhow::Result<CompletionRequest> {
    let body = ChatCompletionBody {
        messages: vec![ChatMessage::user(message)],
        stream: Some(stream),
        ..Default::default()
    };
    Ok(CompletionRequest::resolve(body, &cfg.request_defaults())?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let mut cfg = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve {
            bind,
            upstream,
            model,
        } => {
            if let Some(b) = bind {
                cfg.server.bind = b;
            }
            if let Some(u) = upstream {
                cfg.upstream.base_url = u;
            }
            if let Some(m) = model {
                cfg.upstream.default_model = m;
            }
            let http = HttpClient::from_cfg(&cfg.http)?;
            let provider = LmStudio::from_cfg(http, &cfg.upstream);
            info!(
                upstream = provider.base_url(),
                model = %cfg.upstream.default_model,
                "starting gateway"
            );
            let state = AppState::new(Arc::new(provider), cfg.request_defaults(), cfg.relay.clone());
            run_gateway(&cfg.server.bind, state).await?;
        }
        Commands::Dummy {
            bind,
            chunk_delay_ms,
        } => {
            if let Some(ms) = chunk_delay_ms {
                cfg.dummy.chunk_delay_ms = ms;
            }
            let state = AppState::new(
                Arc::new(Dummy::new(&cfg.dummy)),
                cfg.dummy_request_defaults(),
                cfg.relay.clone(),
            );
            run_gateway(&bind, state).await?;
        }
        Commands::Chat { base, message } => {
            let provider = client_provider(&cfg, base)?;
            let req = one_message(&cfg, message, false)?;
            let rid = uuid::Uuid::new_v4().to_string();
            let resp = provider
                .chat(&req, &RequestCtx::with_request_id(&rid))
                .await?;
            println!("{} -> {}", resp.model, resp.first_text().unwrap_or(""));
        }
        Commands::ChatStream { base, message } => {
            let provider = client_provider(&cfg, base)?;
            let req = one_message(&cfg, message, true)?;
            let rid = uuid::Uuid::new_v4().to_string();
            let mut stream = provider
                .chat_stream(&req, &RequestCtx::with_request_id(&rid))
                .await?;
            use std::io::{self, Write};
            let mut saw_delta = false;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(txt) = chunk.delta_content() {
                            saw_delta = true;
                            print!("{txt}");
                            io::stdout().flush().ok();
                        }
                        if let Some(reason) = chunk.finish_reason() {
                            if saw_delta {
                                println!();
                            }
                            eprintln!("[stop: {}]", reason.as_str());
                        }
                    }
                    Err(err) => {
                        eprintln!("[error: {err}]");
                        break;
                    }
                }
            }
        }
        Commands::Health { base } => {
            let provider = client_provider(&cfg, base)?;
            let report = provider.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
