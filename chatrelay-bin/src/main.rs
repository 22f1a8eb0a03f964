use std::io::Write;
use std::path::PathBuf;

use chatrelay_core::{
    client::RelayClient,
    config::{Config, HttpCfg, ProviderKind},
    error::RelayError,
    gateway::{self, AppState},
    provider_factory::build_provider,
    session::{ExchangeOutcome, Mode, Session},
};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Parser)]
#[command(author, version, about = "chat relay gateway and client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve {
        /// JSON or TOML config file; environment variables are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, help = "Override the listening port")]
        port: Option<u16>,
        #[arg(long, help = "Use the offline echo provider")]
        offline: bool,
    },
    /// Interactive chat against a running gateway (prints deltas live)
    Chat {
        #[command(flatten)]
        opts: ClientOpts,
        #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
        system: String,
    },
    /// Send a single message and print the reply
    Ask {
        #[command(flatten)]
        opts: ClientOpts,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
}

#[derive(Args)]
struct ClientOpts {
    #[arg(long, default_value = "http://localhost:5050")]
    url: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long, help = "Wait for the whole reply instead of streaming")]
    no_stream: bool,
}

impl ClientOpts {
    fn session(&self, system: Option<String>) -> anyhow::Result<Session<RelayClient>> {
        let client = RelayClient::new(self.url.clone(), &HttpCfg::default())?;
        let mode = if self.no_stream {
            Mode::Blocking
        } else {
            Mode::Streaming
        };
        let mut session = Session::new(client, system).with_mode(mode);
        session.set_model(self.model.clone());
        session.set_temperature(self.temperature);
        Ok(session)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chatrelay=info,chatrelay_core=info,tower_http=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            port,
            offline,
        } => {
            let mut cfg = match config {
                Some(path) => Config::from_path(&path)?,
                None => Config::from_env()?,
            };
            if let Some(p) = port {
                cfg.server.port = p;
            }
            if offline {
                cfg.upstream.provider = ProviderKind::Null;
            }
            serve(cfg).await?;
        }
        Commands::Chat { opts, system } => {
            let system = Some(system).filter(|s| !s.trim().is_empty());
            chat(opts.session(system)?).await?;
        }
        Commands::Ask { opts, message } => {
            let session = opts.session(Some(DEFAULT_SYSTEM_PROMPT.to_string()))?;
            if !run_exchange(&session, &message).await {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "chatrelay starting");
    let provider = build_provider(&cfg)?;
    let app = gateway::router(AppState::new(provider, &cfg), &cfg.server)?;
    let listener = gateway::bind(&cfg.server).await?;
    gateway::serve(listener, app, shutdown_signal()).await?;
    Ok(())
}

async fn chat(mut session: Session<RelayClient>) -> anyhow::Result<()> {
    eprintln!("commands: /stream, /block, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/stream" => session.set_mode(Mode::Streaming),
            "/block" => session.set_mode(Mode::Blocking),
            text => {
                run_exchange(&session, text).await;
            }
        }
    }
    Ok(())
}

/// Run one exchange, printing the reply. Ctrl-C cancels the exchange in
/// flight. Returns false if it failed.
async fn run_exchange(session: &Session<RelayClient>, text: &str) -> bool {
    let exchange = match session.submit(text) {
        Ok(ex) => ex,
        Err(e) => {
            eprintln!("[error: {}]", describe(&e));
            return false;
        }
    };

    let abort = exchange.abort_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });

    let streaming = session.mode() == Mode::Streaming;
    let result = exchange
        .run(|delta| {
            print!("{delta}");
            std::io::stdout().flush().ok();
        })
        .await;
    watcher.abort();

    match result {
        Ok(ExchangeOutcome::Completed(content)) => {
            if streaming {
                println!();
            } else {
                println!("{content}");
                if let Some(u) = session.last_usage() {
                    let n = |v: Option<u32>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
                    eprintln!(
                        "[tokens: {} prompt / {} completion / {} total]",
                        n(u.prompt_tokens),
                        n(u.completion_tokens),
                        n(u.total_tokens)
                    );
                }
            }
            true
        }
        Ok(ExchangeOutcome::Cancelled) => {
            println!();
            eprintln!("[cancelled]");
            true
        }
        Err(e) => {
            if streaming {
                println!();
            }
            eprintln!("[error: {}]", describe(&e));
            false
        }
    }
}

fn describe(e: &RelayError) -> String {
    match e {
        // Stream failures carry the gateway's own message.
        RelayError::Upstream {
            status: None,
            message,
        } => message.clone(),
        other => other.to_string(),
    }
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; draining connections");
}
