//! WebSocket client with request/response correlation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use mego_protocol::{Request, Response, decode_message, decode_value, encode_message, encode_value};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult, RemoteError};
use crate::event::{Event, Listener};
use crate::request::RequestBuilder;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type Listeners = Arc<RwLock<HashMap<String, Vec<Listener>>>>;

/// Client for one mego server.
///
/// A client owns at most one connection at a time. Every connection starts a
/// fresh request id sequence, and requests still waiting when it ends fail
/// with [`ClientError::Closed`].
pub struct Client {
    config: ClientConfig,
    keys: HashMap<String, Value>,
    link: RwLock<Option<Arc<Link>>>,
    listeners: Listeners,
    file_ids: AtomicU64,
}

impl Client {
    /// Creates a client for `url` with default settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(url))
    }

    /// Creates a client from settings.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            keys: HashMap::new(),
            link: RwLock::new(None),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            file_ids: AtomicU64::new(0),
        }
    }

    /// Adds a key sent to the server in the init frame.
    pub fn with_key(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keys.insert(key.into(), value.into());
        self
    }

    /// Returns the client settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the session id assigned by the server, once connected.
    pub fn session_id(&self) -> Option<String> {
        self.link.read().as_ref().and_then(|link| link.session_id())
    }

    /// Returns true while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.link.read().as_ref().is_some_and(|link| !link.is_closed())
    }

    /// Opens the connection and sends the init frame.
    ///
    /// An existing connection is closed first. Returns the session id.
    pub async fn connect(&self) -> ClientResult<String> {
        let url = &self.config.url;
        debug!(url = %url, "connecting to server");

        let timeout = self.config.timeout();
        let (ws, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ClientError::Connection(format!(
                    "connection timed out after {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| ClientError::Connection(format!("failed to connect to {}: {}", url, e)))?;

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link::new(outbound_tx));

        tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(stream, link.clone(), self.listeners.clone()));
        link.attach(reader);

        if let Some(previous) = self.link.write().replace(link.clone()) {
            previous.shutdown();
        }

        let keys = encode_value(&self.keys)?;
        let mut slot = link.register()?;
        link.send(&Request::init(keys, slot.id()))?;
        let response = slot.wait(timeout, "init").await?;
        let session_id = match response.error {
            Some(error) => return Err(ClientError::Remote(error.into())),
            None => decode_value::<String>(&response.result)?,
        };

        link.set_session_id(session_id.clone());
        info!(url = %url, session = %session_id, "connected");
        Ok(session_id)
    }

    /// Closes the connection. Pending requests fail with [`ClientError::Closed`].
    pub fn close(&self) {
        if let Some(link) = self.link.write().take() {
            debug!("closing connection");
            link.shutdown();
        }
    }

    /// Closes the current connection and opens a new one.
    pub async fn reconnect(&self) -> ClientResult<String> {
        self.close();
        self.connect().await
    }

    /// Starts a call to `method`.
    pub fn call(&self, method: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method.into())
    }

    /// Sends a call without waiting for any response.
    pub fn notify<T: Serialize + ?Sized>(&self, method: &str, params: &T) -> ClientResult<()> {
        let params = encode_value(params)?;
        self.link()?.send(&Request::notify(method, params))
    }

    /// Joins `channel` of `event`.
    pub async fn subscribe(&self, event: &str, channel: &str) -> ClientResult<()> {
        let link = self.link()?;
        let mut slot = link.register()?;
        link.send(&Request::subscribe(event, channel, slot.id()))?;
        let response = slot.wait(self.config.timeout(), "subscribe").await?;
        match response.error {
            Some(error) => Err(ClientError::SubscriptionRefused {
                event: event.to_string(),
                channel: channel.to_string(),
                error: error.into(),
            }),
            None => {
                debug!(event, channel, "subscribed");
                Ok(())
            }
        }
    }

    /// Leaves `channel` of `event`.
    pub async fn unsubscribe(&self, event: &str, channel: &str) -> ClientResult<()> {
        let link = self.link()?;
        let mut slot = link.register()?;
        link.send(&Request::unsubscribe(event, channel, slot.id()))?;
        let response = slot.wait(self.config.timeout(), "unsubscribe").await?;
        match response.error {
            Some(error) => Err(ClientError::Remote(error.into())),
            None => Ok(()),
        }
    }

    /// Registers `listener` for pushes of `event`.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(event.into())
            .or_default()
            .push(Arc::new(listener));
    }

    pub(crate) fn link(&self) -> ClientResult<Arc<Link>> {
        match self.link.read().as_ref() {
            Some(link) if !link.is_closed() => Ok(link.clone()),
            _ => Err(ClientError::Closed),
        }
    }

    pub(crate) fn next_file_id(&self) -> u64 {
        self.file_ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.shutdown();
        }
    }
}

/// One connection: outbound queue, pending slots and the id sequence.
pub(crate) struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    // `None` once the connection ended.
    pending: Mutex<Option<HashMap<u64, mpsc::UnboundedSender<Response>>>>,
    next_id: AtomicU64,
    session_id: RwLock<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    fn new(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(0),
            session_id: RwLock::new(None),
            reader: Mutex::new(None),
        }
    }

    fn attach(&self, reader: JoinHandle<()>) {
        *self.reader.lock() = Some(reader);
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn set_session_id(&self, id: String) {
        *self.session_id.write() = Some(id);
    }

    fn is_closed(&self) -> bool {
        self.pending.lock().is_none()
    }

    /// Allocates an id and a slot receiving every response carrying it.
    pub(crate) fn register(self: &Arc<Self>) -> ClientResult<Slot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pending = self.pending.lock();
        let slots = pending.as_mut().ok_or(ClientError::Closed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        slots.insert(id, tx);
        Ok(Slot {
            link: self.clone(),
            id,
            rx,
        })
    }

    pub(crate) fn send(&self, request: &Request) -> ClientResult<()> {
        let frame = encode_message(request)?;
        self.outbound
            .send(Message::Binary(frame))
            .map_err(|_| ClientError::Closed)
    }

    fn release(&self, id: u64) {
        if let Some(slots) = self.pending.lock().as_mut() {
            slots.remove(&id);
        }
    }

    fn route(&self, response: Response) {
        let id = response.id;
        let slots = self.pending.lock();
        match slots.as_ref().and_then(|slots| slots.get(&id)) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(id, "discarding response without a pending request"),
        }
    }

    /// Fails every pending request.
    fn drain(&self) -> usize {
        self.pending.lock().take().map_or(0, |slots| slots.len())
    }

    fn shutdown(&self) {
        let drained = self.drain();
        if drained > 0 {
            debug!(drained, "failed pending requests on close");
        }
        // The writer exits after flushing the close frame.
        let _ = self.outbound.send(Message::Close(None));
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// A pending request slot. Dropping it releases the id.
pub(crate) struct Slot {
    link: Arc<Link>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Response>,
}

impl Slot {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next response carrying this slot's id.
    pub(crate) async fn wait(&mut self, timeout: Duration, what: &str) -> ClientResult<Response> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => {
                warn!(id = self.id, what, "request timed out");
                Err(ClientError::Timeout(format!(
                    "no response to {} within {}ms",
                    what,
                    timeout.as_millis()
                )))
            }
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.link.release(self.id);
    }
}

/// Turns a terminal response into its result payload.
pub(crate) fn into_result(response: Response) -> ClientResult<Bytes> {
    match response.error {
        Some(error) => Err(ClientError::Remote(RemoteError::from(error))),
        None => Ok(response.result),
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, link: Arc<Link>, listeners: Listeners) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => match decode_message::<Response>(&data) {
                Ok(response) if response.is_unsolicited() => dispatch_event(&listeners, response),
                Ok(response) => link.route(response),
                Err(e) => debug!(error = %e, "dropping undecodable frame"),
            },
            Ok(Message::Close(_)) => {
                debug!("server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    let drained = link.drain();
    if drained > 0 {
        debug!(drained, "connection lost with pending requests");
    }
}

fn dispatch_event(listeners: &Listeners, response: Response) {
    let callbacks = match listeners.read().get(&response.event) {
        Some(callbacks) => callbacks.clone(),
        None => {
            debug!(event = %response.event, "no listener for event");
            return;
        }
    };
    let event = Event {
        name: response.event,
        data: response.result,
    };
    for callback in callbacks {
        callback(event.clone());
    }
}
