// pushdesk: receive Pushover notifications on the desktop
//
// Commands:
//   pushdesk login --email <email> --password <password> [--device-name <name>]
//   pushdesk logout
//   pushdesk run
//   pushdesk status [--json]
//   pushdesk sounds

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pushdesk_lib::config::Config;
use pushdesk_lib::connection::manager::{Collaborators, ConnectionManager, ManagerTiming};
use pushdesk_lib::connection::reachability::NetworkReachability;
use pushdesk_lib::connection::state::ConnectionState;
use pushdesk_lib::connection::wake::spawn_wake_detector;
use pushdesk_lib::delivery::display::{DisplayDriver, LogPresenter, NativePresenter, Presenter};
use pushdesk_lib::delivery::icon::IconCache;
use pushdesk_lib::delivery::sound::{SoundCache, SoundPlayer, SOUNDS};
use pushdesk_lib::delivery::store::{FileNotificationStore, NotificationStore};
use pushdesk_lib::protocol::rest::{PushoverApi, RestClient, DEFAULT_API_BASE_URL};
use pushdesk_lib::protocol::socket::{WebSocketConnector, DEFAULT_SOCKET_ENDPOINT};
use pushdesk_lib::settings::{Settings, SettingsCredentialStore};

const DEFAULT_LOG_FILTER: &str = "pushdesk=info,pushdesk_lib=info";

/// How long `run` waits for the socket to close on exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How many archived notifications `status` prints
const STATUS_RECENT: usize = 5;

#[derive(Debug, Parser)]
#[command(name = "pushdesk", version, about = "Pushover notifications on the desktop")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and register this machine as a Pushover device
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "PUSHDESK_PASSWORD", hide_env_values = true)]
        password: String,
        /// 1-25 characters: letters, digits, '_' or '-'
        #[arg(long, default_value = "pushdesk")]
        device_name: String,
    },
    /// Forget the stored secret and device id
    Logout,
    /// Connect and show notifications until interrupted
    Run,
    /// Show account and archive information
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List the available notification sounds
    Sounds,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config
        .ensure_dirs()
        .with_context(|| format!("Failed to create {}", config.state_dir().display()))?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;

    match cli.command {
        Command::Login {
            email,
            password,
            device_name,
        } => runtime.block_on(login(&config, email, password, device_name)),
        Command::Logout => logout(&config),
        Command::Run => runtime.block_on(run(config)),
        Command::Status { json } => status(&config, json),
        Command::Sounds => sounds(&config),
    }
}

fn rest_client(settings: &Settings) -> Result<RestClient> {
    let base_url = settings
        .api_base_url
        .as_deref()
        .unwrap_or(DEFAULT_API_BASE_URL);
    RestClient::with_base_url(base_url).map_err(|e| anyhow!(e))
}

async fn login(config: &Config, email: String, password: String, device_name: String) -> Result<()> {
    let settings = Settings::load(config)?;
    let client = rest_client(&settings)?;

    let account = client
        .login(&email, &password)
        .await
        .context("Login failed")?;
    let device = client
        .register_device(&account.secret, &device_name)
        .await
        .context("Device registration failed")?;

    Settings::update(config, |settings| {
        settings.account.email = Some(email.clone());
        settings.account.user_key = Some(account.user_key.clone());
        settings.account.secret = Some(account.secret.clone());
        settings.account.device_id = Some(device.device_id.clone());
        settings.account.device_name = Some(device_name.clone());
    })?;

    info!(device = %device_name, "device registered");
    println!("Logged in as {} (device {})", email, device_name);
    Ok(())
}

fn logout(config: &Config) -> Result<()> {
    Settings::update(config, Settings::clear_credentials)?;
    println!("Logged out");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let settings = Settings::load(&config)?;
    let credentials = settings
        .credentials()
        .context("Not logged in; run `pushdesk login` first")?;

    let api_base_url = settings
        .api_base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let socket_endpoint = settings
        .socket_endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_SOCKET_ENDPOINT.to_string());

    let store = FileNotificationStore::open(config.notifications_file())?;
    let collaborators = Collaborators {
        api: Arc::new(rest_client(&settings)?),
        connector: Arc::new(WebSocketConnector::new(socket_endpoint)),
        reachability: Arc::new(NetworkReachability::for_base_url(&api_base_url)),
        credential_store: Arc::new(SettingsCredentialStore::new(config.clone())),
        store: Box::new(store),
    };

    let (manager, manager_task) = ConnectionManager::spawn(
        collaborators,
        Some(credentials),
        settings.pipeline_config(),
        ManagerTiming::default(),
    );

    let presenter: Arc<dyn Presenter> = if settings.native_notifications {
        Arc::new(NativePresenter)
    } else {
        Arc::new(LogPresenter)
    };
    let sounds = Arc::new(SoundPlayer::spawn(SoundCache::new(config.sounds_dir()))?);
    let display_task = tokio::spawn(
        DisplayDriver::new(presenter, sounds)
            .with_icons(IconCache::new(config.icons_dir()))
            .run(manager.subscribe_displays()),
    );

    let wake_handle = manager.clone();
    let wake_task = spawn_wake_detector(move |slept| wake_handle.wake(slept));

    let mut status = manager.subscribe_status();
    manager.start();

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break Err(anyhow!("connection manager stopped unexpectedly"));
                }
                let current = status.borrow_and_update().clone();
                debug!(
                    state = %current.state,
                    messages = current.messages_received,
                    "status"
                );
                if current.max_failures_exceeded {
                    error!("login rejected too many times, credentials cleared");
                    break Err(anyhow!("Login rejected; run `pushdesk login` again"));
                }
                if current.state == ConnectionState::Offline {
                    warn!("offline, waiting for connectivity");
                }
            }
        }
    };

    manager.stop();
    wake_task.abort();
    display_task.abort();
    drop(manager);
    if tokio::time::timeout(SHUTDOWN_GRACE, manager_task).await.is_err() {
        warn!("connection manager did not shut down in time");
    }

    outcome
}

#[derive(Debug, Serialize)]
struct StatusReport {
    logged_in: bool,
    email: Option<String>,
    device_name: Option<String>,
    messages_received: usize,
    default_sound: String,
    max_notification_amount: usize,
    native_notifications: bool,
}

fn status(config: &Config, json: bool) -> Result<()> {
    let settings = Settings::load(config)?;
    let store = FileNotificationStore::open(config.notifications_file())?;

    let report = StatusReport {
        logged_in: settings.credentials().is_some(),
        email: settings.account.email.clone(),
        device_name: settings.account.device_name.clone(),
        messages_received: store.count(),
        default_sound: settings.default_sound.clone(),
        max_notification_amount: settings.max_notification_amount,
        native_notifications: settings.native_notifications,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match (&report.email, report.logged_in) {
        (Some(email), true) => println!(
            "Logged in as {} (device {})",
            email,
            report.device_name.as_deref().unwrap_or("?")
        ),
        _ => println!("Not logged in"),
    }
    println!("Messages received: {}", report.messages_received);
    println!("Default sound: {}", report.default_sound);

    let recent = store.recent(STATUS_RECENT);
    if !recent.is_empty() {
        println!();
        for notification in recent {
            println!(
                "{}  {}: {}",
                notification.received_at.format("%Y-%m-%d %H:%M"),
                notification.display_title(),
                notification.message.lines().next().unwrap_or("")
            );
        }
    }
    Ok(())
}

fn sounds(config: &Config) -> Result<()> {
    let settings = Settings::load(config)?;
    for (key, name) in SOUNDS {
        let marker = if *key == settings.default_sound { "*" } else { " " };
        println!("{} {:<3} {}", marker, key, name);
    }
    Ok(())
}
