//! Control channel transports.
//!
//! The session drives the channel through two seams:
//!
//! * a [`Connector`] opens a transport and completes the handshake,
//! * a [`Transport`] carries messages until it closes.
//!
//! [`WebsocketConnector`] is the production implementation. Keepalive uses
//! websocket ping frames; any frame from the server counts as a sign of life.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use http::{header, HeaderValue};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    config::SessionConfig,
    error::{Error, Result},
    protocol::{ClientHello, ClientMessage, ServerHello, ServerMessage},
};

/// What a transport received.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Message(ServerMessage),
    /// Keepalive traffic without payload.
    Alive,
    /// The peer closed the channel, optionally with a reason.
    Closed(Option<String>),
}

/// An open control channel.
pub trait Transport {
    /// Sends one message.
    fn send(&mut self, message: ClientMessage) -> impl Future<Output = Result<()>>;

    /// Receives the next message.
    ///
    /// Must be cancel safe: dropping the future before completion loses no
    /// message.
    fn recv(&mut self) -> impl Future<Output = Result<Incoming>>;

    /// Sends a keepalive ping.
    fn ping(&mut self) -> impl Future<Output = Result<()>>;

    /// Closes the channel. Errors while closing are logged, not returned.
    fn close(&mut self) -> impl Future<Output = ()>;
}

/// Opens transports.
pub trait Connector {
    type Transport: Transport;

    /// Opens a transport to the configured server, sends `hello` and waits
    /// for the server's acknowledgement.
    fn connect(
        &self,
        hello: ClientHello,
        config: SessionConfig,
    ) -> impl Future<Output = Result<(Self::Transport, ServerHello)>>;
}

/// Websocket endpoint path below the server URL.
const WEBSOCKET_PATH: &str = "sendspin";

/// Derives the websocket endpoint from a server URL.
///
/// # Errors
///
/// Returns [`Error::invalid_url`] for schemes other than `http` and `https`.
pub fn websocket_url(server_url: &Url) -> Result<Url> {
    let scheme = match server_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        scheme => {
            return Err(Error::invalid_url(format!(
                "unsupported scheme {scheme} in {server_url}"
            )))
        }
    };

    let mut url = server_url.clone();
    url.set_scheme(scheme)
        .map_err(|()| Error::invalid_url(format!("cannot use {scheme} for {server_url}")))?;

    let path = format!("{}/{WEBSOCKET_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}

#[derive(Clone, Debug)]
pub struct WebsocketConnector {
    user_agent: String,
}

impl WebsocketConnector {
    #[must_use]
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl Connector for WebsocketConnector {
    type Transport = WebsocketTransport;

    async fn connect(
        &self,
        hello: ClientHello,
        config: SessionConfig,
    ) -> Result<(Self::Transport, ServerHello)> {
        let url = websocket_url(&config.server_url)?;
        debug!("opening websocket to {url}");

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(header::USER_AGENT, HeaderValue::from_str(&self.user_agent)?);
        if let Some(token) = config.auth_token.as_deref() {
            let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))?;
            bearer.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, bearer);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        trace!("websocket upgrade: {}", response.status());

        let mut transport = WebsocketTransport { stream };
        transport.send(ClientMessage::Hello(hello)).await?;

        loop {
            match transport.recv().await? {
                Incoming::Message(ServerMessage::Hello(server_hello)) => {
                    return Ok((transport, server_hello));
                }
                Incoming::Message(message) => {
                    debug!("ignoring {} before handshake", message.kind());
                }
                Incoming::Alive => {}
                Incoming::Closed(reason) => {
                    return Err(Error::unavailable(format!(
                        "server closed the connection during handshake: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    )));
                }
            }
        }
    }
}

pub struct WebsocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebsocketTransport {
    /// Text frames larger than this are dropped unparsed.
    pub const MAX_FRAME_SIZE: usize = 64 * 1024;
}

impl Transport for WebsocketTransport {
    async fn send(&mut self, message: ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        trace!("sending {text}");
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Incoming> {
        loop {
            let Some(frame) = self.stream.next().await else {
                return Ok(Incoming::Closed(None));
            };

            match frame? {
                Message::Text(text) => {
                    let size = text.len();
                    if size > Self::MAX_FRAME_SIZE {
                        error!("ignoring oversized message with {size} bytes");
                        return Ok(Incoming::Alive);
                    }

                    trace!("received {}", text.as_str());
                    match ServerMessage::from_json(text.as_str()) {
                        Ok(message) => return Ok(Incoming::Message(message)),
                        Err(e) => {
                            error!("ignoring malformed message: {e}");
                            return Ok(Incoming::Alive);
                        }
                    }
                }
                Message::Close(frame) => {
                    let reason = frame
                        .map(|frame| frame.reason.as_str().to_owned())
                        .filter(|reason| !reason.is_empty());
                    return Ok(Incoming::Closed(reason));
                }
                // Pongs to incoming pings are queued by tungstenite and
                // flushed with the next write.
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {
                    return Ok(Incoming::Alive);
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        trace!("ping");
        self.stream.send(Message::Ping(Default::default())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("error closing websocket: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory transport for session tests.

    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex, MutexGuard},
    };

    use tokio::{sync::mpsc, time::Instant};

    use super::{ClientHello, ClientMessage, Connector, Incoming, ServerHello, SessionConfig, Transport};
    use crate::error::{Error, ErrorKind, Result};

    /// How the next connect attempt behaves.
    #[derive(Copy, Clone, Debug)]
    pub(crate) enum Outcome {
        Accept,
        Fail(ErrorKind),
        /// Never completes.
        Hang,
    }

    #[derive(Default)]
    struct Shared {
        outcomes: VecDeque<Outcome>,
        connects: usize,
        attempted_at: Vec<Instant>,
        silent: bool,
        sent: Vec<ClientMessage>,
        server: Option<mpsc::UnboundedSender<Incoming>>,
        live: usize,
        max_live: usize,
    }

    /// Accepts every attempt unless told otherwise.
    #[derive(Clone, Default)]
    pub(crate) struct MockConnector {
        shared: Arc<Mutex<Shared>>,
    }

    impl MockConnector {
        fn lock(&self) -> MutexGuard<'_, Shared> {
            self.shared.lock().unwrap()
        }

        pub(crate) fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
            self.lock().outcomes.extend(outcomes);
        }

        /// Number of connect attempts made so far.
        pub(crate) fn connects(&self) -> usize {
            self.lock().connects
        }

        /// When each connect attempt started.
        pub(crate) fn attempted_at(&self) -> Vec<Instant> {
            self.lock().attempted_at.clone()
        }

        /// Stops answering pings on current and future transports.
        pub(crate) fn set_silent(&self, silent: bool) {
            self.lock().silent = silent;
        }

        /// Messages sent after the handshake.
        pub(crate) fn sent(&self) -> Vec<ClientMessage> {
            self.lock().sent.clone()
        }

        pub(crate) fn commands_sent(&self) -> usize {
            self.lock()
                .sent
                .iter()
                .filter(|message| matches!(message, ClientMessage::Command(_)))
                .count()
        }

        /// Delivers `incoming` to the most recently accepted transport.
        pub(crate) fn push(&self, incoming: Incoming) {
            if let Some(server) = self.lock().server.as_ref() {
                let _ = server.send(incoming);
            }
        }

        /// Transports currently open.
        pub(crate) fn live(&self) -> usize {
            self.lock().live
        }

        /// Highest number of simultaneously open transports.
        pub(crate) fn max_live(&self) -> usize {
            self.lock().max_live
        }
    }

    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn connect(
            &self,
            hello: ClientHello,
            _config: SessionConfig,
        ) -> Result<(Self::Transport, ServerHello)> {
            let outcome = {
                let mut shared = self.lock();
                shared.connects += 1;
                shared.attempted_at.push(Instant::now());
                shared.outcomes.pop_front().unwrap_or(Outcome::Accept)
            };

            match outcome {
                Outcome::Accept => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let mut shared = self.lock();
                    shared.server = Some(tx.clone());
                    shared.live += 1;
                    shared.max_live = shared.max_live.max(shared.live);
                    drop(shared);

                    let transport = MockTransport {
                        rx,
                        pong: tx,
                        shared: Arc::clone(&self.shared),
                        open: true,
                    };
                    let server_hello = ServerHello {
                        server_id: Some("mock".to_owned()),
                        name: Some(format!("mock for {}", hello.name)),
                    };
                    Ok((transport, server_hello))
                }
                Outcome::Fail(kind) => Err(Error::new(kind, "scripted failure")),
                Outcome::Hang => std::future::pending().await,
            }
        }
    }

    pub(crate) struct MockTransport {
        rx: mpsc::UnboundedReceiver<Incoming>,
        pong: mpsc::UnboundedSender<Incoming>,
        shared: Arc<Mutex<Shared>>,
        open: bool,
    }

    impl MockTransport {
        fn shut(&mut self) {
            if std::mem::take(&mut self.open) {
                self.shared.lock().unwrap().live -= 1;
            }
        }
    }

    impl Transport for MockTransport {
        async fn send(&mut self, message: ClientMessage) -> Result<()> {
            if !self.open {
                return Err(Error::closed("mock transport is closed"));
            }
            self.shared.lock().unwrap().sent.push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Incoming> {
            match self.rx.recv().await {
                Some(incoming) => Ok(incoming),
                None => std::future::pending().await,
            }
        }

        async fn ping(&mut self) -> Result<()> {
            if !self.shared.lock().unwrap().silent {
                let _ = self.pong.send(Incoming::Alive);
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.shut();
        }
    }

    impl Drop for MockTransport {
        fn drop(&mut self) {
            self.shut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn websocket_url_follows_scheme() {
        let url = websocket_url(&Url::parse("http://example.local:8095").unwrap()).unwrap();
        assert_eq!(url.as_str(), "ws://example.local:8095/sendspin");

        let url = websocket_url(&Url::parse("https://example.com/ma/").unwrap()).unwrap();
        assert_eq!(url.as_str(), "wss://example.com/ma/sendspin");
    }

    #[test]
    fn websocket_url_rejects_other_schemes() {
        let err = websocket_url(&Url::parse("ftp://example.com").unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidUrl);
    }
}
