use async_trait::async_trait;
use clap::{Parser, Subcommand};
use moltqq::bridge::{Bridge, ChatOptions};
use moltqq::channels::{ChatOutbound, InboundHandler, InboundMessage, PushForwarder};
use moltqq::config::{self, Config};
use moltqq::gateway::GatewayClient;
use moltqq::routing::SessionKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "moltqq")]
#[command(about = "QQ to Moltbot Gateway bridge", long_about = None)]
struct Cli {
    /// Verbose logging (also enabled by `debug: true` in the config)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: MOLTQQ_CONFIG_PATH or ~/.moltqq/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat through the gateway as a QQ user (interactive). Pushes for the session are printed too.
    Chat {
        /// Config file path (default: MOLTQQ_CONFIG_PATH or ~/.moltqq/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// QQ user id to chat as.
        #[arg(long, short, default_value = "cli")]
        user: String,

        /// Chat as a member of this group instead of privately.
        #[arg(long, short, value_name = "GROUP_ID")]
        group: Option<String>,
    },

    /// Send one message and print the reply.
    Send {
        /// Config file path (default: MOLTQQ_CONFIG_PATH or ~/.moltqq/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, short, default_value = "cli")]
        user: String,

        #[arg(long, short, value_name = "GROUP_ID")]
        group: Option<String>,

        /// Thinking level passed to the agent (e.g. "low", "high").
        #[arg(long)]
        thinking: Option<String>,

        /// Message text.
        message: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let debug = cli.debug || config_requests_debug(&cli);
    let default_filter = if debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Some(Commands::Version) => {
            println!("moltqq {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            user,
            group,
        }) => {
            if let Err(e) = run_chat(config, user, group).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send {
            config,
            user,
            group,
            thinking,
            message,
        }) => {
            if let Err(e) = run_send(config, user, group, thinking, message).await {
                eprintln!("send failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// `debug: true` in the config file; unreadable config counts as false (the command reports it).
fn config_requests_debug(cli: &Cli) -> bool {
    let path = match &cli.command {
        Some(Commands::Chat { config, .. }) | Some(Commands::Send { config, .. }) => config.clone(),
        _ => return false,
    };
    config::load_config(path)
        .map(|(c, _)| c.debug)
        .unwrap_or(false)
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = moltqq::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

/// Writes replies and pushes to stdout.
struct StdoutOutbound;

#[async_trait]
impl ChatOutbound for StdoutOutbound {
    async fn deliver(&self, target: &SessionKey, text: &str) -> anyhow::Result<()> {
        let mut stdout = tokio::io::stdout();
        let line = format!("< [{}] {}\n", target, text);
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

fn load(config_path: Option<PathBuf>) -> anyhow::Result<Config> {
    let (config, path) = config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    Ok(config)
}

/// Connect to the gateway described by the config.
async fn connect(config: &Config) -> anyhow::Result<Bridge> {
    let options = config::client_options(&config);
    let url = options.url.clone();
    let client = GatewayClient::new(options);
    client.connect().await.map_err(|e| {
        anyhow::anyhow!("connecting to gateway at {}: {}", url, e)
    })?;
    log::info!("connected to gateway at {}", url);
    let bridge = Bridge::new(client, config.gateway.timeout())
        .with_push_event(config.gateway.push_event.clone());
    Ok(bridge)
}

fn inbound(user: &str, group: Option<&str>, text: &str) -> InboundMessage {
    match group {
        Some(group_id) => InboundMessage::group(group_id, user, text),
        None => InboundMessage::private(user, text),
    }
}

async fn run_chat(
    config_path: Option<PathBuf>,
    user: String,
    group: Option<String>,
) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let bridge = connect(&config).await?;
    let out: Arc<dyn ChatOutbound> = Arc::new(StdoutOutbound);
    bridge.on_push(Arc::new(PushForwarder::new(Arc::clone(&out))));
    let handler = InboundHandler::new(bridge.clone(), config::resolve_allowed_users(&config))
        .with_deny_reply(config.access.deny_reply.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, closing gateway connection");
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        let msg = inbound(&user, group.as_deref(), input);
        if let Err(e) = handler.handle(&msg, out.as_ref()).await {
            eprintln!("chat error: {:#}", e);
        }
    }

    bridge.client().close().await;
    Ok(())
}

async fn run_send(
    config_path: Option<PathBuf>,
    user: String,
    group: Option<String>,
    thinking: Option<String>,
    message: String,
) -> anyhow::Result<()> {
    let config = load(config_path)?;
    if !config::user_admitted(&config, &user) {
        if let Some(reply) = config.access.deny_reply.as_deref().filter(|r| !r.trim().is_empty()) {
            println!("{}", reply);
        }
        anyhow::bail!("user {} is not in the allow-list", user);
    }
    let bridge = connect(&config).await?;
    let session = inbound(&user, group.as_deref(), &message).session_key();
    let options = ChatOptions {
        thinking,
        ..ChatOptions::default()
    };
    let result = bridge.chat(&session, &message, options).await;
    let closing = bridge.client().close();
    tokio::time::timeout(Duration::from_secs(2), closing).await.ok();
    match result? {
        Some(reply) => println!("{}", reply),
        None => eprintln!("(no response)"),
    }
    Ok(())
}
