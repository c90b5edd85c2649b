//! Backend protocol drivers.
//!
//! A [`Driver`] owns the physical side of a node: it opens and closes the
//! WebSocket control channel and executes HTTP requests. The node state
//! machine only ever talks to the trait, so supporting a new backend
//! major version means adding a [`DriverKind`] variant and its driver.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::NodeOptions;
use crate::error::{Error, Result};
use crate::node::NodeSettings;

const REQUEST_TIMEOUT_SECS: u64 = 10;
const ABNORMAL_CLOSE: u16 = 1006;

/// Supported backend protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DriverKind {
    #[default]
    Lavalink4,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Lavalink4 => "lavalink/v4",
        }
    }

    /// Major version used in the `/v<N>` path prefix.
    pub fn version(&self) -> u8 {
        match self {
            DriverKind::Lavalink4 => 4,
        }
    }

    /// Builds the driver for this protocol version.
    pub fn build(self, options: &NodeOptions, settings: &NodeSettings) -> Result<Arc<dyn Driver>> {
        match self {
            DriverKind::Lavalink4 => {
                Ok(Arc::new(LavalinkDriver::new(self, options.clone(), settings)?))
            }
        }
    }
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lavalink/v4" | "lavalink4" | "v4" => Ok(DriverKind::Lavalink4),
            other => Err(Error::InvalidDriver(format!(
                "'{other}' is not a supported backend (expected lavalink/v4)"
            ))),
        }
    }
}

impl TryFrom<String> for DriverKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DriverKind> for String {
    fn from(kind: DriverKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the transport reports back to the node, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    /// Always the last event of a transport
    Close { code: u16, reason: String },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// An HTTP request relative to the driver's REST base (`/v<N>`).
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestResponse {
    pub status: u16,
    pub body: String,
}

/// Physical connection capability of a node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    fn ws_url(&self) -> String;

    /// Opens a fresh WebSocket. `resume_session` is offered to the server
    /// so it can hand back the previous session's state.
    async fn connect(&self, resume_session: Option<String>) -> Result<TransportEvents>;

    /// Closes the current WebSocket, the close is reported on its transport.
    async fn ws_close(&self);

    async fn fetch(&self, request: RestRequest) -> Result<RestResponse>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Driver for Lavalink-compatible servers.
pub struct LavalinkDriver {
    kind: DriverKind,
    options: NodeOptions,
    user_id: String,
    client_name: String,
    http: reqwest::Client,
    rest_url: Url,
    sink: Arc<Mutex<Option<(u64, WsSink)>>>,
    generation: AtomicU64,
}

impl LavalinkDriver {
    pub fn new(kind: DriverKind, options: NodeOptions, settings: &NodeSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(settings.client_name.clone())
            .build()?;

        let scheme = if options.secure { "https" } else { "http" };
        let rest_url = Url::parse(&format!(
            "{scheme}://{}:{}/v{}",
            options.host,
            options.port,
            kind.version()
        ))?;

        Ok(Self {
            kind,
            options,
            user_id: settings.user_id.clone(),
            client_name: settings.client_name.clone(),
            http,
            rest_url,
            sink: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        })
    }

    pub fn rest_url(&self) -> &str {
        self.rest_url.as_str()
    }
}

fn header(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Transport(format!("invalid header value: {e}")))
}

#[async_trait]
impl Driver for LavalinkDriver {
    fn kind(&self) -> DriverKind {
        self.kind
    }

    fn ws_url(&self) -> String {
        let scheme = if self.options.secure { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}/v{}/websocket",
            self.options.host,
            self.options.port,
            self.kind.version()
        )
    }

    async fn connect(&self, resume_session: Option<String>) -> Result<TransportEvents> {
        let mut request = self.ws_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", header(&self.options.auth)?);
        headers.insert("User-Id", header(&self.user_id)?);
        headers.insert("Client-Name", header(&self.client_name)?);
        if let Some(session_id) = &resume_session {
            headers.insert("Session-Id", header(session_id)?);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = Arc::clone(&self.sink);
        let (tx, rx) = mpsc::unbounded_channel();
        let node = self.options.name.clone();

        tokio::spawn(async move {
            let stream = match tokio_tungstenite::connect_async(request).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    let _ = tx.send(TransportEvent::Error(e.to_string()));
                    let _ = tx.send(TransportEvent::Close {
                        code: ABNORMAL_CLOSE,
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            let (write, mut read) = stream.split();
            *sink.lock().await = Some((generation, write));
            let _ = tx.send(TransportEvent::Open);

            let mut close = None;
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        trace!(node = %node, "<- {text}");
                        let _ = tx.send(TransportEvent::Message(text));
                    }
                    Ok(Message::Close(frame)) => {
                        close = Some(
                            frame
                                .map(|f| (u16::from(f.code), f.reason.into_owned()))
                                .unwrap_or((1000, String::new())),
                        );
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Error(e.to_string()));
                        close = Some((ABNORMAL_CLOSE, e.to_string()));
                        break;
                    }
                }
            }

            {
                let mut current = sink.lock().await;
                if matches!(current.as_ref(), Some((id, _)) if *id == generation) {
                    current.take();
                }
            }

            let (code, reason) =
                close.unwrap_or_else(|| (ABNORMAL_CLOSE, "connection dropped".to_string()));
            debug!(node = %node, code, "websocket closed");
            let _ = tx.send(TransportEvent::Close { code, reason });
        });

        Ok(rx)
    }

    async fn ws_close(&self) {
        let mut current = self.sink.lock().await;
        if let Some((_, sink)) = current.as_mut() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                warn!(node = %self.options.name, "failed to send close frame: {e}");
            }
        }
    }

    async fn fetch(&self, request: RestRequest) -> Result<RestResponse> {
        let url = format!("{}{}", self.rest_url(), request.path);
        let mut builder = self.http.request(request.method, &url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(RestResponse { status, body })
    }
}
