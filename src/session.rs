//! The control session: connect, reconnect, disconnect.
//!
//! A [`Session`] owns the transport, the reconnect policy and the state
//! synchronizer, and is driven by [`Session::run`]. Everything else talks to it
//! through a cloneable [`Handle`], so there is exactly one writer of the
//! connection state and requests are handled in the order they were made.
//!
//! Connection lifecycle:
//!
//! ```text
//! Idle ──connect──▶ Connecting ──hello──▶ Connected
//!                      ▲    │                 │ closed, heartbeat lost
//!          delay over  │    │ failed          ▼
//!                      └─ Error ◀─────────────┘
//! any ──disconnect──▶ Idle
//! ```
//!
//! Transient failures back off as configured and are only visible as the
//! state's `connection_error`. After too many consecutive failures, or after
//! a failure that retrying cannot fix, the session stays in `Error` until
//! `connect` is called again.

use std::{future::Future, pin::Pin, rc::Rc};

use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant, Interval, MissedTickBehavior, Sleep},
};

use crate::{
    audio::AudioKeeper,
    command::{Command, Dispatcher},
    config::{SessionConfig, Settings, DEFAULT_CLIENT_NAME},
    error::{Error, Result},
    identity::ClientIdentity,
    lease::Coordinator,
    policy::ReconnectPolicy,
    protocol::{ClientHello, ClientMessage, PlayerReport, ServerHello, ServerMessage},
    state::{ConnectionState, PlaybackState, ServerUpdate, Synchronizer},
    storage::{Key, SharedStorage, Storage, StorageExt},
    subscribers::{Registry, Subscription},
    transport::{Connector, Incoming, Transport},
};

#[derive(Debug)]
enum Request {
    Connect(SessionConfig),
    Disconnect(String),
    Command(Command, oneshot::Sender<Result<()>>),
    Interaction,
    Visibility(bool),
    Resume,
}

/// Cloneable access to a running [`Session`].
///
/// When the last handle is dropped the session disconnects and
/// [`Session::run`] returns.
#[derive(Clone, Debug)]
pub struct Handle {
    requests: mpsc::UnboundedSender<Request>,
    registry: Registry,
}

impl Handle {
    fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::cancelled("session has ended"))
    }

    /// Connects to the configured server, replacing any current connection.
    ///
    /// Does nothing while connecting or connected with an equal config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::cancelled`] if the session has ended.
    pub fn connect(&self, config: SessionConfig) -> Result<()> {
        self.request(Request::Connect(config))
    }

    /// Tears down the connection and cancels pending retries. Does nothing
    /// when idle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::cancelled`] if the session has ended.
    pub fn disconnect(&self, reason: impl Into<String>) -> Result<()> {
        self.request(Request::Disconnect(reason.into()))
    }

    /// Sends a playback command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::command_rejected`] if the command failed validation
    /// and was not sent, the transport's error if sending failed, or
    /// [`Error::cancelled`] if the session has ended.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::Command(command, tx))?;
        rx.await
            .map_err(|_| Error::cancelled("session ended before handling the command"))?
    }

    /// Reports a user interaction, which unlocks audio output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::cancelled`] if the session has ended.
    pub fn user_interaction(&self) -> Result<()> {
        self.request(Request::Interaction)
    }

    /// Reports whether the host is in the foreground.
    ///
    /// # Errors
    ///
    /// Returns [`Error::cancelled`] if the session has ended.
    pub fn set_visible(&self, visible: bool) -> Result<()> {
        self.request(Request::Visibility(visible))
    }

    /// Resumes audio output if the platform suspended it, for example after
    /// the process was stopped and continued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::cancelled`] if the session has ended.
    pub fn resume_audio(&self) -> Result<()> {
        self.request(Request::Resume)
    }

    /// Subscribes to state changes. See [`Registry::subscribe`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PlaybackState) + Send + Sync + 'static,
    {
        self.registry.subscribe(listener)
    }

    /// The latest published state.
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.registry.snapshot()
    }
}

type Attempt<T> = Pin<Box<dyn Future<Output = Result<(T, ServerHello)>>>>;

struct Link<T> {
    transport: T,
    last_seen: Instant,
    heartbeat: Interval,
    progress: Interval,
}

enum Phase<T> {
    Idle,
    Connecting(Attempt<T>),
    Connected(Link<T>),
    Backoff(Pin<Box<Sleep>>),
    /// Failed for good until the next `connect`.
    Stopped,
}

enum Event<T> {
    Request(Option<Request>),
    Attempt(Result<(T, ServerHello)>),
    Retry,
    Incoming(Result<Incoming>),
    Heartbeat,
    Tick,
}

/// Session connector for one client identity.
pub struct Session<C: Connector> {
    connector: Rc<C>,
    identity: ClientIdentity,
    settings: Settings,
    storage: SharedStorage,
    requests: mpsc::UnboundedReceiver<Request>,
    phase: Phase<C::Transport>,
    config: Option<SessionConfig>,
    policy: ReconnectPolicy,
    sync: Synchronizer,
    dispatcher: Dispatcher,
    audio: AudioKeeper,
}

impl<C> Session<C>
where
    C: Connector + 'static,
    C::Transport: 'static,
{
    /// Creates an idle session and its handle.
    ///
    /// The local volume and mute flag are restored from `storage`.
    pub fn new(
        connector: C,
        identity: ClientIdentity,
        storage: SharedStorage,
        settings: Settings,
    ) -> (Self, Handle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Registry::new();

        let mut sync = Synchronizer::new(registry.clone());
        let (volume, muted) = Self::stored_volume(storage.as_ref(), sync.state());
        sync.set_local_volume(volume, muted);

        let session = Self {
            connector: Rc::new(connector),
            identity,
            policy: ReconnectPolicy::new(&settings.reconnect),
            settings,
            storage,
            requests: rx,
            phase: Phase::Idle,
            config: None,
            sync,
            dispatcher: Dispatcher::new(),
            audio: AudioKeeper::disabled(),
        };

        let handle = Handle {
            requests: tx,
            registry,
        };

        (session, handle)
    }

    #[must_use]
    pub fn with_audio(mut self, audio: AudioKeeper) -> Self {
        self.audio = audio;
        self
    }

    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    fn stored_volume(
        storage: &dyn Storage,
        fallback: &PlaybackState,
    ) -> (u8, bool) {
        let volume = storage
            .get_parsed::<u8>(Key::Volume)
            .unwrap_or_else(|e| {
                warn!("failed to read saved volume: {e}");
                None
            })
            .map_or(fallback.volume, |volume| volume.min(100));
        let muted = storage
            .get_parsed::<bool>(Key::Muted)
            .unwrap_or_else(|e| {
                warn!("failed to read saved mute flag: {e}");
                None
            })
            .unwrap_or(fallback.muted);

        (volume, muted)
    }

    /// Claims the exclusivity lease for this identity, then runs the session
    /// for as long as the lease is held.
    ///
    /// Requests made while waiting for the lease are handled once it is
    /// acquired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::unavailable`] if another context took the lease over.
    pub async fn run_exclusive(self, coordinator: &Coordinator) -> Result<()> {
        let lease = coordinator.acquire(&self.identity).await;
        info!("holding session lease {}", lease.name());

        self.run_until_lost(lease.hold()).await
    }

    /// Handles requests until every [`Handle`] is dropped.
    ///
    /// # Errors
    ///
    /// Connection failures are never returned; they are reported through the
    /// state. This currently always returns `Ok`.
    pub async fn run(self) -> Result<()> {
        self.run_until_lost(std::future::pending()).await
    }

    /// Runs the session until every [`Handle`] is dropped, or until `lost`
    /// completes. Losing closes the connection and reports the error in the
    /// state before returning it.
    async fn run_until_lost(mut self, lost: impl Future<Output = Error>) -> Result<()> {
        tokio::pin!(lost);

        loop {
            let event = tokio::select! {
                biased;
                error = &mut lost => {
                    self.lose(&error).await;
                    return Err(error);
                }
                event = self.next_event() => event,
            };

            match event {
                Event::Request(None) => {
                    self.disconnect("session closed").await;
                    return Ok(());
                }
                Event::Request(Some(request)) => self.handle_request(request).await,
                Event::Attempt(result) => self.handle_attempt(result).await,
                Event::Retry => self.start_attempt(),
                Event::Incoming(result) => self.handle_incoming(result).await,
                Event::Heartbeat => self.heartbeat().await,
                Event::Tick => {
                    self.sync.tick(Instant::now());
                }
            }
        }
    }

    /// Gives up the connection for good after the session lease was lost.
    async fn lose(&mut self, error: &Error) {
        error!("{error}");

        self.teardown().await;
        self.phase = Phase::Stopped;
        self.config = None;
        self.policy.reset();
        self.sync
            .set_connection(ConnectionState::Error, Some(error.to_string()));
    }

    async fn next_event(&mut self) -> Event<C::Transport> {
        let requests = &mut self.requests;
        let sync = &self.sync;

        // Requests take priority so a disconnect cancels pending work before
        // it gets a chance to complete.
        match &mut self.phase {
            Phase::Idle | Phase::Stopped => Event::Request(requests.recv().await),
            Phase::Connecting(attempt) => tokio::select! {
                biased;
                request = requests.recv() => Event::Request(request),
                result = attempt => Event::Attempt(result),
            },
            Phase::Backoff(delay) => tokio::select! {
                biased;
                request = requests.recv() => Event::Request(request),
                () = delay => Event::Retry,
            },
            Phase::Connected(link) => tokio::select! {
                biased;
                request = requests.recv() => Event::Request(request),
                incoming = link.transport.recv() => Event::Incoming(incoming),
                _ = link.heartbeat.tick() => Event::Heartbeat,
                _ = link.progress.tick(), if sync.is_progressing() => Event::Tick,
            },
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect(config) => self.connect(config).await,
            Request::Disconnect(reason) => self.disconnect(&reason).await,
            Request::Command(command, reply) => {
                let result = self.send_command(command).await;
                if reply.send(result).is_err() {
                    trace!("caller stopped waiting for {command}");
                }
            }
            Request::Interaction => self.audio.on_interaction(),
            Request::Visibility(visible) => self.audio.on_visibility(visible),
            Request::Resume => self.audio.resume(),
        }
    }

    async fn connect(&mut self, config: SessionConfig) {
        let same_config = self.config.as_ref() == Some(&config);
        if same_config && matches!(self.phase, Phase::Connecting(_) | Phase::Connected(_)) {
            debug!("already connected to {}", config.server_url_str());
            return;
        }

        // Never let two transports of this identity overlap.
        self.teardown().await;
        if !same_config {
            self.sync.reset();
        }

        info!("connecting to {}", config.server_url_str());
        self.sync.set_server_url(Some(config.server_url.clone()));
        self.config = Some(config);
        self.policy.reset();
        self.start_attempt();
    }

    async fn disconnect(&mut self, reason: &str) {
        if matches!(self.phase, Phase::Idle) {
            debug!("not connected, ignoring disconnect: {reason}");
            return;
        }

        self.teardown().await;
        self.config = None;
        self.policy.reset();
        self.sync.reset();

        info!("disconnected: {reason}");
    }

    /// Closes the transport and drops pending attempts and retry timers.
    async fn teardown(&mut self) {
        if let Phase::Connected(mut link) = std::mem::replace(&mut self.phase, Phase::Idle) {
            link.transport.close().await;
        }
    }

    fn start_attempt(&mut self) {
        let Some(config) = self.config.clone() else {
            self.phase = Phase::Idle;
            return;
        };

        let hello = ClientHello {
            client_id: self.identity.to_string(),
            name: config
                .client_name
                .clone()
                .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_owned()),
            auth_token: config.auth_token.clone(),
        };

        let connector = Rc::clone(&self.connector);
        let timeout = self.settings.connect_timeout;
        self.phase = Phase::Connecting(Box::pin(async move {
            match time::timeout(timeout, connector.connect(hello, config)).await {
                Ok(result) => result,
                Err(elapsed) => Err(Error::from(elapsed)),
            }
        }));

        let error = self.sync.state().connection_error.clone();
        self.sync.set_connection(ConnectionState::Connecting, error);
    }

    async fn handle_attempt(&mut self, result: Result<(C::Transport, ServerHello)>) {
        let (mut transport, server_hello) = match result {
            Ok(connected) => connected,
            Err(e) => return self.fail(e).await,
        };

        let state = self.sync.state();
        let (volume, muted) = Self::stored_volume(self.storage.as_ref(), state);
        let report = ClientMessage::State(PlayerReport { volume, muted });
        if let Err(e) = transport.send(report).await {
            transport.close().await;
            return self.fail(e).await;
        }

        let url = self
            .config
            .as_ref()
            .map_or("", SessionConfig::server_url_str);
        match server_hello.name.as_deref() {
            Some(name) => info!("connected to {name} at {url}"),
            None => info!("connected to {url}"),
        }

        self.policy.reset();

        let now = Instant::now();
        let heartbeat = self.settings.heartbeat_interval;
        let tick = self.settings.progress_tick;
        let mut link = Link {
            transport,
            last_seen: now,
            heartbeat: time::interval_at(now + heartbeat, heartbeat),
            progress: time::interval_at(now + tick, tick),
        };
        link.heartbeat
            .set_missed_tick_behavior(MissedTickBehavior::Delay);
        link.progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.phase = Phase::Connected(link);
        self.sync.set_connection(ConnectionState::Connected, None);
    }

    async fn handle_incoming(&mut self, result: Result<Incoming>) {
        let incoming = match result {
            Ok(incoming) => incoming,
            Err(e) => return self.fail(e).await,
        };

        if let Phase::Connected(link) = &mut self.phase {
            link.last_seen = Instant::now();
        }

        match incoming {
            Incoming::Message(ServerMessage::State(update)) => self.apply(update),
            Incoming::Message(ServerMessage::Hello(_)) => debug!("ignoring repeated server hello"),
            Incoming::Message(ServerMessage::Other(kind)) => trace!("ignoring {kind}"),
            Incoming::Alive => {}
            Incoming::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "closed by server".to_owned());
                self.fail(Error::closed(reason)).await;
            }
        }
    }

    fn apply(&mut self, update: ServerUpdate) {
        let before = (self.sync.state().volume, self.sync.state().muted);
        let was_playing = self.sync.state().is_playing;

        self.sync.apply(update, Instant::now());

        let state = self.sync.state();
        let (volume, muted) = (state.volume, state.muted);
        if (volume, muted) != before {
            for (key, value) in [(Key::Volume, volume.to_string()), (Key::Muted, muted.to_string())] {
                if let Err(e) = self.storage.set(key, &value) {
                    warn!("failed to save {key}: {e}");
                }
            }
        }

        match (was_playing, state.is_playing) {
            (false, true) => self.audio.resume(),
            (true, false) => self.audio.pause(),
            _ => {}
        }
    }

    async fn heartbeat(&mut self) {
        let Phase::Connected(link) = &mut self.phase else {
            return;
        };

        let silence = link.last_seen.elapsed();
        if silence >= self.settings.heartbeat_timeout {
            let e = Error::protocol(format!(
                "no sign of life for {:.1}s",
                silence.as_secs_f32()
            ));
            return self.fail(e).await;
        }

        let result = link.transport.ping().await;
        if let Err(e) = result {
            self.fail(e).await;
        }
    }

    async fn send_command(&mut self, command: Command) -> Result<()> {
        let transport = match &mut self.phase {
            Phase::Connected(link) => Some(&mut link.transport),
            _ => None,
        };

        let result = self
            .dispatcher
            .dispatch(command, self.sync.state(), transport)
            .await;

        if let Err(e) = &result {
            if e.is_transient() {
                self.fail(Error::new(e.kind, e.error.to_string())).await;
            }
        }

        result
    }

    /// Moves to `Error` and schedules a retry if the failure is transient
    /// and the attempt budget allows it.
    async fn fail(&mut self, error: Error) {
        self.teardown().await;
        error!("connection failed: {error}");

        self.phase = if error.is_transient() {
            match self.policy.record_failure() {
                Some(delay) => {
                    info!(
                        "reconnecting in {:.1}s (attempt {} of {})",
                        delay.as_secs_f32(),
                        self.policy.attempt_count(),
                        self.policy.max_attempts()
                    );
                    Phase::Backoff(Box::pin(time::sleep(delay)))
                }
                None => {
                    warn!(
                        "giving up after {} failed attempts",
                        self.policy.max_attempts()
                    );
                    Phase::Stopped
                }
            }
        } else {
            Phase::Stopped
        };

        self.sync
            .set_connection(ConnectionState::Error, Some(error.to_string()));
    }
}
