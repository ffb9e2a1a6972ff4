use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use vet_notify::{
    ChannelConfig, ConnectionState, Notification, NotificationChannel, SessionCookies, StaticToken,
    TokenSource,
};

#[derive(Parser, Debug)]
#[command(name = "vet-notify")]
#[command(about = "Listen to live notifications from the practice backend", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to config file (default: <config dir>/vet-notify/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config and VET_API_BASE)
    #[arg(long)]
    api_base: Option<String>,

    /// Bearer token
    #[arg(long, env = "VET_JWT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Cookie header to read the token from, e.g. "jwtToken=eyJ..."
    #[arg(long, conflicts_with = "token")]
    cookie: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print notifications until Ctrl-C
    Listen {
        /// Print each notification as a JSON line
        #[arg(long)]
        json: bool,
    },
    /// Ask the hub for a test notification and wait for it
    SendTest {
        /// Seconds to wait for the connection and for the echo
        #[arg(long, default_value = "15")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vet_notify=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let tokens = token_source(&cli, &config)?;
    let channel = NotificationChannel::builder(config, tokens)
        .build()
        .context("Failed to set up notification channel")?;

    match cli.command {
        Command::Listen { json } => listen(channel, json).await,
        Command::SendTest { timeout } => send_test(channel, Duration::from_secs(timeout)).await,
    }
}

fn load_config(cli: &Cli) -> Result<ChannelConfig> {
    let mut config = match cli.config.clone().or_else(ChannelConfig::default_path) {
        Some(path) => ChannelConfig::load_or_default(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let mut config = ChannelConfig::default();
            config.apply_env()?;
            config
        }
    };
    if let Some(api_base) = &cli.api_base {
        config.api_base = api_base.clone();
    }
    config.validate()?;
    Ok(config)
}

fn token_source(cli: &Cli, config: &ChannelConfig) -> Result<Arc<dyn TokenSource>> {
    if let Some(header) = &cli.cookie {
        let jar = SessionCookies::from_header(config.cookie_name.clone(), header);
        if jar.token().is_none() {
            bail!("Cookie header has no '{}' cookie", config.cookie_name);
        }
        return Ok(Arc::new(jar));
    }
    match &cli.token {
        Some(token) if !token.trim().is_empty() => Ok(Arc::new(StaticToken::new(token.trim()))),
        _ => bail!("No credential: pass --token, set VET_JWT_TOKEN or pass --cookie"),
    }
}

async fn listen(channel: NotificationChannel, json: bool) -> Result<()> {
    let mut states = channel.watch_state();
    channel.on_notification(move |notification| print_notification(notification, json));
    channel.init();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                eprintln!("{} {}", "channel".dimmed(), paint_state(state));
            }
        }
    }

    eprintln!("{}", "Stopping...".dimmed());
    channel.stop().await;
    Ok(())
}

async fn send_test(channel: NotificationChannel, timeout: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.on_notification(move |notification| {
        let _ = tx.send(notification.clone());
    });

    let mut states = channel.watch_state();
    // The watch guard must be released before stop() publishes a new state
    let connected = matches!(
        tokio::time::timeout(
            timeout,
            states.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await,
        Ok(Ok(_))
    );
    if !connected {
        channel.stop().await;
        bail!("Not connected after {:?}", timeout);
    }

    channel.send_test_notification().await;
    let echoed = tokio::time::timeout(timeout, rx.recv()).await;
    channel.stop().await;

    match echoed {
        Ok(Some(notification)) => {
            println!("{} {}", "✓".green(), notification);
            Ok(())
        }
        _ => bail!("No test notification received within {:?}", timeout),
    }
}

fn print_notification(notification: &Notification, json: bool) {
    if json {
        match serde_json::to_string(notification) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("{} {}", "Unprintable notification:".red(), e),
        }
        return;
    }

    let when = notification
        .created_at()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
    let kind = format!("[{}]", notification.kind()).cyan().bold();
    if notification.title().is_empty() {
        println!("{} {} {}", when.dimmed(), kind, notification.message());
    } else {
        println!(
            "{} {} {}: {}",
            when.dimmed(),
            kind,
            notification.title().bold(),
            notification.message()
        );
    }
}

fn paint_state(state: ConnectionState) -> colored::ColoredString {
    match state {
        ConnectionState::Connected => state.as_str().green(),
        ConnectionState::Connecting | ConnectionState::Reconnecting => state.as_str().yellow(),
        ConnectionState::Disconnected => state.as_str().red(),
    }
}
