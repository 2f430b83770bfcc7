use std::{
    error::Error,
    path::{Path, PathBuf},
    process,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use veil::Redact;

use sendspin_session::{
    audio::AudioKeeper,
    config::{normalize_server_url, Settings},
    events::{Event, Hook},
    identity::IdentityStore,
    lease::{Coordinator, FileLeaseStore},
    session::{Handle, Session},
    signal::{self, ControlSignal},
    source::{ConfigInput, Fallback, HttpConfigSource},
    state::PlaybackState,
    storage::{FileStorage, SharedStorage},
    subscribers::Subscription,
    transport::WebsocketConnector,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Time the session gets to close its connection on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Default, PartialEq, Eq, Redact, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// State file
    ///
    /// Holds the client identity and the last used server, name and volume.
    /// Session leases are kept in a `leases` directory next to it.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("state.toml"))]
    state_file: String,

    /// Server URL
    ///
    /// Overrides the configuration endpoint and the last used server. A
    /// missing scheme defaults to `http://`.
    #[arg(long, value_hint = ValueHint::Url, env = "SENDSPIN_SERVER_URL")]
    server_url: Option<String>,

    /// Player's name
    ///
    /// Set the player's name as it appears to the server.
    ///
    /// [default: system hostname]
    #[arg(short, long, value_hint = ValueHint::Hostname)]
    name: Option<String>,

    /// Authentication token
    ///
    /// Presented to the server during the handshake.
    #[redact]
    #[arg(long, env = "SENDSPIN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Configuration endpoint
    ///
    /// URL returning JSON with the server URL, player name and token. It is
    /// polled for changes while running.
    #[arg(long, value_hint = ValueHint::Url)]
    config_url: Option<String>,

    /// Settings file
    ///
    /// TOML file overriding timeouts, reconnect and lease tunables.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    settings: Option<PathBuf>,

    /// Hook script
    ///
    /// Run on playback and connection events, with the event name in `EVENT`.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::ExecutablePath)]
    hook: Option<PathBuf>,

    /// Do not open an audio output device
    #[arg(long, default_value_t = false)]
    no_audio: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("sendspin_session", level);
    }

    logger.init();
}

/// Directory holding the session leases, next to the state file.
fn lease_dir(state_file: &Path) -> PathBuf {
    state_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("leases")
}

/// Forwards playback events to the log and the hook.
fn watch_events(handle: &Handle, hook: Option<Hook>) -> Subscription {
    let (tx, mut rx) = mpsc::unbounded_channel::<(Event, PlaybackState)>();

    tokio::spawn(async move {
        while let Some((event, state)) = rx.recv().await {
            debug!("event: {event}");
            if let Some(hook) = hook.as_ref() {
                if let Err(e) = hook.run(event, &state).await {
                    error!("{e}");
                }
            }
        }
    });

    let previous = Mutex::new(None::<PlaybackState>);
    handle.subscribe(move |state| {
        let Ok(mut previous) = previous.lock() else {
            return;
        };
        if let Some(prev) = previous.replace(state.clone()) {
            for event in Event::diff(&prev, state) {
                let _ = tx.send((event, state.clone()));
            }
        }
    })
}

/// Resolves the configuration, connects on changes, and reacts to signals
/// until asked to shut down.
async fn control(
    handle: Handle,
    source: Fallback<HttpConfigSource>,
    settings: &Settings,
    mut signals: signal::Handler,
) -> sendspin_session::error::Result<()> {
    let mut poll = tokio::time::interval(settings.config_poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut current = None;
    let mut last_error = None;

    // Starting the player is the interaction that unlocks audio output.
    handle.user_interaction()?;

    loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("shutting down gracefully on {signal}");
                    handle.disconnect("shutting down")?;
                    break Ok(());
                }

                match signal {
                    ControlSignal::Reload => {
                        info!("reloading configuration on {signal}");
                        handle.disconnect("reloading")?;
                        current = None;
                        poll.reset_immediately();
                    }
                    ControlSignal::Resume => {
                        debug!("back in the foreground on {signal}");
                        handle.resume_audio()?;
                    }
                    ControlSignal::Interrupt | ControlSignal::Terminate => {}
                }
            }

            _ = poll.tick() => match source.resolve().await {
                Ok(config) => {
                    last_error = None;
                    if current.as_ref() != Some(&config) {
                        debug!("configuration changed: {config:?}");
                        handle.connect(config.clone())?;
                        current = Some(config);
                    }
                }
                Err(e) => {
                    // Sources are polled continuously: only report changes.
                    let message = e.to_string();
                    if last_error.as_ref() != Some(&message) {
                        warn!("{message}");
                        last_error = Some(message);
                    }
                }
            },
        }
    }
}

/// Main application loop.
///
/// # Errors
///
/// Returns an error when startup fails: an unreadable settings or state
/// file, an invalid server URL on the command line, or signal handlers that
/// cannot be installed. Anything after that is retried or logged.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let settings = match args.settings.as_deref() {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };

    if let Some(url) = args.server_url.as_deref() {
        normalize_server_url(url)?;
    }

    let state_file = PathBuf::from(&args.state_file);
    let storage: SharedStorage = Arc::new(FileStorage::new(&state_file));
    let identity = IdentityStore::new(storage.as_ref()).load_or_create()?;

    let primary = args
        .config_url
        .as_deref()
        .map(|url| HttpConfigSource::new(url, &settings))
        .transpose()?;
    let overrides = ConfigInput {
        server_url: args.server_url,
        client_name: args.name,
        auth_token: args.token,
    };
    let source = Fallback::new(overrides, primary, Arc::clone(&storage));

    let leases = FileLeaseStore::new(lease_dir(&state_file));
    let coordinator = Coordinator::new(Arc::new(leases), settings.lease);

    let connector = WebsocketConnector::new(settings.user_agent.clone());
    let (mut session, handle) = Session::new(connector, identity, storage, settings.clone());
    if !args.no_audio {
        session = session.with_audio(AudioKeeper::open_default());
    }

    let signals = signal::Handler::new()?;
    let _events = watch_events(&handle, args.hook.map(Hook::new));

    let session = session.run_exclusive(&coordinator);
    tokio::pin!(session);

    tokio::select! {
        result = &mut session => {
            if let Err(e) = result {
                info!("session ended: {e}");
            }
        }

        result = control(handle, source, &settings, signals) => {
            if let Err(e) = result {
                debug!("control loop ended: {e}");
            }

            // All handles are gone now, so the session disconnects and
            // returns.
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, session).await.is_err() {
                warn!("session did not close within {}s", SHUTDOWN_TIMEOUT.as_secs());
            }
        }
    }

    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
