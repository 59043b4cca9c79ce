//! Turbacz dashboard console
//!
//! Joins one dashboard channel and drives it from stdin. Every server push is
//! printed as it arrives; `help` lists the commands.

use turbacz_session::{
    config::{token::DEFAULT_COOKIE, ClientConfig, TokenConfig},
    dashboard::{commands::HELP, parse_line, FleetStatus, LineCommand},
    logging::{init_logging, LogConfig},
    protocol::{Configuration, SwitchPress},
    Channel, CommandTracker, Dashboard, DashboardView, Intent, IntentOutcome, OutputState,
    OutputView, SessionHandle, SessionManager, TargetKey, ToggleOutcome,
};

use anyhow::Context;
use clap::Parser;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use url::Url;

/// Turbacz dashboard console
#[derive(Parser, Debug)]
#[command(name = "turbacz-dash")]
#[command(about = "Console client for the Turbacz home automation dashboard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "TURBACZ_CONFIG")]
    config: Option<PathBuf>,

    /// Dashboard server, e.g. https://home.example.com
    #[arg(long)]
    url: Option<Url>,

    /// Channel to join: lights, blinds, heating, rcm or a custom path
    #[arg(long)]
    channel: Option<Channel>,

    /// Access token sent with every connection attempt
    #[arg(long)]
    token: Option<String>,

    /// Cookie jar holding the access token; re-read on every reconnect
    #[arg(long, conflicts_with = "token")]
    cookie_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Also log to this file, rolled daily
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::from_env();
        if self.debug {
            config = config.with_level(Level::DEBUG);
        }
        if let Some(path) = &self.log_file {
            config.file_path = Some(path.clone());
        }
        config
    }

    /// File, then environment, then command line
    fn client_config(&self) -> turbacz_session::Result<ClientConfig> {
        let mut config = match (&self.config, &self.url) {
            (Some(path), _) => {
                let mut config = ClientConfig::from_file(path)?;
                config.apply_env()?;
                config
            }
            (None, Some(url)) => {
                let mut config = ClientConfig::new(url.clone(), Channel::Lights);
                config.apply_env()?;
                config
            }
            (None, None) => ClientConfig::from_env()?,
        };

        if let Some(url) = &self.url {
            config.server = url.clone();
        }
        if let Some(channel) = &self.channel {
            config.channel = channel.clone();
        }
        if let Some(token) = &self.token {
            config.token = TokenConfig::Static {
                token: token.clone(),
            };
        } else if let Some(path) = &self.cookie_file {
            config.token = TokenConfig::CookieFile {
                path: path.clone(),
                cookie: DEFAULT_COOKIE.to_string(),
            };
        }

        config.validate()?;
        Ok(config)
    }
}

/// Prints every change to stdout
#[derive(Default)]
struct ConsoleView {
    configuration: Option<Configuration>,
}

impl OutputView for ConsoleView {
    fn render(&mut self, target: &TargetKey, state: OutputState) -> bool {
        let name = self
            .configuration
            .as_ref()
            .and_then(|configuration| configuration.output(target))
            .map(|output| output.name.as_str())
            .unwrap_or("");
        println!("  {target} {state} {name}");
        true
    }
}

impl DashboardView for ConsoleView {
    fn connection_changed(&mut self, connected: bool) {
        println!("* {}", if connected { "connected" } else { "disconnected" });
    }

    fn configuration_changed(&mut self, configuration: &Configuration) {
        println!(
            "* configuration: {} outputs in {} sections",
            configuration.targets().count(),
            configuration.sections.len()
        );
        self.configuration = Some(configuration.clone());
    }

    fn fleet_changed(&mut self, fleet: &FleetStatus) {
        let outdated: Vec<&str> = fleet.outdated().collect();
        println!(
            "* fleet: {} relays, {} switches online, outdated: [{}]",
            fleet.online_relays.len(),
            fleet.online_switches.len(),
            outdated.join(", ")
        );
    }

    fn blind_moved(&mut self, blind: &str, slider: u16) {
        println!("  blind {blind} at {slider}");
    }

    fn switch_pressed(&mut self, press: &SwitchPress) {
        println!(
            "  switch {} button {} pressed",
            press.switch_id, press.button_id
        );
    }

    fn telemetry_received(&mut self, record: &Map<String, Value>) {
        for (field, value) in record {
            println!("  {field} = {value}");
        }
    }

    fn intent_handled(&mut self, _intent: &Intent, outcome: &IntentOutcome) {
        match outcome {
            IntentOutcome::Toggle(ToggleOutcome::Debounced) => {
                println!("! still waiting for the previous command")
            }
            IntentOutcome::Toggle(ToggleOutcome::NotConnected) => {
                println!("! not connected, reconnecting")
            }
            IntentOutcome::Toggle(ToggleOutcome::SendFailed) => println!("! command not sent"),
            IntentOutcome::Dropped { reason } => println!("! not sent: {reason}"),
            IntentOutcome::Rejected { reason } => println!("! {reason}"),
            _ => {}
        }
    }
}

/// Feeds intents until `quit` or end of input. `quit` shuts the session
/// down, which ends the dashboard; end of input leaves it following the
/// session.
async fn read_console(handle: SessionHandle, intents: mpsc::Sender<Intent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("end of input, following the session only");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };

        match parse_line(&line) {
            Ok(LineCommand::Intent(intent)) => {
                if intents.send(intent).await.is_err() {
                    break;
                }
            }
            Ok(LineCommand::Status) => match handle.statistics().await {
                Ok(stats) => match serde_json::to_string_pretty(&stats) {
                    Ok(text) => println!("{text}"),
                    Err(e) => eprintln!("{e}"),
                },
                Err(e) => eprintln!("{e}"),
            },
            Ok(LineCommand::Help) => println!("{HELP}"),
            Ok(LineCommand::Quit) => {
                if let Err(e) = handle.shutdown().await {
                    warn!(error = %e, "session already stopped");
                }
                break;
            }
            Ok(LineCommand::Empty) => {}
            Err(e) => eprintln!("{e}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_config()).context("Failed to initialise logging")?;

    let config = args
        .client_config()
        .context("Invalid dashboard configuration")?;

    let manager = SessionManager::from_config(&config)?;
    info!(
        channel = %config.channel,
        session_id = manager.identity().session_id,
        "🚀 Starting dashboard session"
    );

    let (handle, events) = manager.start();
    let tracker = CommandTracker::from_config(ConsoleView::default(), &config.commands);
    let mut dashboard = Dashboard::new(handle.clone(), config.channel.clone(), tracker);

    let (intent_tx, intent_rx) = mpsc::channel(32);
    let console = tokio::spawn(read_console(handle.clone(), intent_tx));

    println!("{HELP}");
    handle.connect();

    dashboard.run(events, intent_rx).await?;

    console.abort();
    info!("Dashboard session closed");
    Ok(())
}
