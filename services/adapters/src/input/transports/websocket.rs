//! WebSocket broker transport
//!
//! Control frames are JSON text messages:
//!
//! ```text
//! -> {"type":"subscribe","key":"k3y","channel":"orders"}
//! -> {"type":"unsubscribe","key":"k3y","channel":"orders"}
//! <- {"type":"message","topic":"orders","payload":"aGVsbG8="}
//! <- {"type":"ack","channel":"orders"}
//! <- {"type":"error","message":"..."}
//! ```
//!
//! Binary frames carry a raw payload and go to every subscription. The read
//! loop runs on its own task and spawns one handler call per message.
//!
//! When the broker drops the connection the read loop reconnects with the
//! descriptor's backoff policy and re-sends a subscribe frame for every live
//! subscription. Only [`SourceTransport::close`] ends the loop for good.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use types::{BrokerEventSource, ConnectionBackoffPolicy};

use super::{channel_matches, BrokerSettings};
use crate::error::{SecretError, TransportError};
use crate::input::connection;
use crate::input::subscription::{
    ChannelSpec, InboundMessage, MessageHandler, SourceTransport, SubscriptionHandle,
};
use crate::secrets::SecretResolver;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type Subscribers = DashMap<u64, (ChannelSpec, Arc<dyn MessageHandler>)>;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame<'a> {
    Subscribe { key: &'a str, channel: &'a str },
    Unsubscribe { key: &'a str, channel: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Message {
        topic: String,
        payload: String,
    },
    Ack {
        #[serde(default)]
        channel: Option<String>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Everything needed to open the socket again after a drop
#[derive(Clone)]
struct Dialer {
    url: Url,
    authorization: Option<HeaderValue>,
    tls: Option<native_tls::TlsConnector>,
}

impl Dialer {
    async fn dial(&self) -> Result<(WsSink, WsSource), TransportError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(value) = &self.authorization {
            request.headers_mut().insert(AUTHORIZATION, value.clone());
        }
        let connector = self.tls.clone().map(Connector::NativeTls);

        let (stream, response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await?;
        debug!(url = %self.url, status = %response.status(), "WebSocket handshake complete");
        Ok(stream.split())
    }
}

/// State shared between a connection handle and its read loop
struct Shared {
    writer: Mutex<Option<WsSink>>,
    subscribers: Subscribers,
    connected: AtomicBool,
    closing: AtomicBool,
}

impl Shared {
    async fn send(&self, frame: &ClientFrame<'_>) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| TransportError::Rejected(format!("unencodable frame: {e}")))?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Re-register every live subscription on a fresh socket
    async fn resubscribe(&self, address: &str) {
        let channels: Vec<ChannelSpec> = self
            .subscribers
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect();

        for channel in &channels {
            let frame = ClientFrame::Subscribe {
                key: &channel.key,
                channel: &channel.name,
            };
            match self.send(&frame).await {
                Ok(()) => info!(%address, channel_name = %channel.name, "resubscribed after reconnect"),
                Err(e) => error!(%address, channel_name = %channel.name, error = %e, "resubscribe failed"),
            }
        }
    }
}

/// Live WebSocket connection
pub struct WsConnection {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl WsConnection {
    /// Whether the socket is currently up
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

/// Broker transport over `ws://` or `wss://`
pub struct WebSocketTransport {
    config: BrokerEventSource,
    secrets: Arc<dyn SecretResolver>,
    next_id: AtomicU64,
}

impl WebSocketTransport {
    /// Transport for one broker block
    pub fn new(config: BrokerEventSource, secrets: Arc<dyn SecretResolver>) -> Self {
        Self {
            config,
            secrets,
            next_id: AtomicU64::new(1),
        }
    }

    fn url(&self) -> Result<Url, TransportError> {
        let url = Url::parse(&self.config.broker).map_err(|e| TransportError::InvalidAddress {
            address: self.config.broker.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(TransportError::InvalidAddress {
                address: self.config.broker.clone(),
                reason: format!("unsupported scheme {other}, expected ws or wss"),
            }),
        }
    }

    fn dialer(&self, settings: &BrokerSettings) -> Result<Dialer, TransportError> {
        let authorization = match &settings.username {
            Some(username) => Some(basic_auth(
                username,
                settings.password.as_deref().unwrap_or_default(),
            )?),
            None => None,
        };
        Ok(Dialer {
            url: self.url()?,
            authorization,
            tls: settings.tls.clone(),
        })
    }
}

fn basic_auth(username: &str, password: &str) -> Result<HeaderValue, TransportError> {
    let token = STANDARD.encode(format!("{username}:{password}"));
    HeaderValue::from_str(&format!("Basic {token}")).map_err(|e| TransportError::InvalidAddress {
        address: "authorization header".to_string(),
        reason: e.to_string(),
    })
}

/// Read frames until the socket ends, handing data frames to subscribers
async fn read_frames(read: &mut WsSource, subscribers: &Subscribers, address: &str) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::Message { topic, payload }) => match STANDARD.decode(&payload) {
                    Ok(bytes) => deliver(subscribers, InboundMessage::new(topic, bytes), false),
                    Err(e) => warn!(%topic, error = %e, "dropping message with invalid base64 payload"),
                },
                Ok(ServerFrame::Ack { channel }) => {
                    debug!(channel = channel.as_deref().unwrap_or(""), "broker ack")
                }
                Ok(ServerFrame::Error { message }) => error!(%address, %message, "broker error"),
                Err(e) => warn!(error = %e, "unrecognized frame from broker"),
            },
            Ok(Message::Binary(bytes)) => {
                deliver(subscribers, InboundMessage::new(String::new(), bytes), true)
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Close(_)) => {
                info!(%address, "broker closed the connection");
                return;
            }
            Err(e) => {
                error!(%address, error = %e, "WebSocket error");
                return;
            }
        }
    }
}

fn spawn_reader(
    mut read: WsSource,
    shared: Arc<Shared>,
    dialer: Dialer,
    backoff: ConnectionBackoffPolicy,
    address: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            read_frames(&mut read, &shared.subscribers, &address).await;
            shared.connected.store(false, Ordering::Release);
            if shared.closing.load(Ordering::Acquire) {
                break;
            }

            *shared.writer.lock().await = None;
            warn!(%address, "broker connection lost, reconnecting");

            let dial = &dialer;
            match connection::establish(&address, &backoff, move || dial.dial()).await {
                Ok((write, next)) => {
                    if shared.closing.load(Ordering::Acquire) {
                        break;
                    }
                    *shared.writer.lock().await = Some(write);
                    shared.connected.store(true, Ordering::Release);
                    read = next;
                    shared.resubscribe(&address).await;
                }
                Err(e) => {
                    error!(%address, error = %e, "giving up on broker connection, no further events will arrive");
                    break;
                }
            }
        }
    })
}

/// Hand a message to matching subscribers, each on its own task
///
/// With `broadcast` the message goes to every subscriber and takes the
/// subscriber's channel name as its topic.
fn deliver(subscribers: &Subscribers, message: InboundMessage, broadcast: bool) {
    for entry in subscribers.iter() {
        let (channel, handler) = entry.value();
        let message = if broadcast {
            InboundMessage {
                topic: channel.name.clone(),
                payload: message.payload.clone(),
            }
        } else if channel_matches(&channel.name, &message.topic) {
            message.clone()
        } else {
            continue;
        };
        let handler = handler.clone();
        tokio::spawn(async move { handler.on_message(message).await });
    }
}

#[async_trait]
impl SourceTransport for WebSocketTransport {
    type Settings = BrokerSettings;
    type Connection = WsConnection;

    fn address(&self) -> String {
        self.config.broker.clone()
    }

    async fn prepare(&self) -> Result<BrokerSettings, SecretError> {
        BrokerSettings::resolve(&self.config, self.secrets.as_ref())
    }

    async fn connect(&self, settings: &BrokerSettings) -> Result<WsConnection, TransportError> {
        let dialer = self.dialer(settings)?;
        let (write, read) = dialer.dial().await?;

        let shared = Arc::new(Shared {
            writer: Mutex::new(Some(write)),
            subscribers: Subscribers::new(),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        });
        let reader = spawn_reader(
            read,
            shared.clone(),
            dialer,
            self.config.backoff(),
            self.config.broker.clone(),
        );

        Ok(WsConnection { shared, reader })
    }

    async fn subscribe(
        &self,
        connection: &WsConnection,
        channel: &ChannelSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // registered first so nothing sent right after the frame is missed
        connection
            .shared
            .subscribers
            .insert(id, (channel.clone(), handler));

        let frame = ClientFrame::Subscribe {
            key: &channel.key,
            channel: &channel.name,
        };
        if let Err(e) = connection.shared.send(&frame).await {
            connection.shared.subscribers.remove(&id);
            return Err(e);
        }

        Ok(SubscriptionHandle {
            id,
            channel: channel.clone(),
        })
    }

    async fn unsubscribe(
        &self,
        connection: &WsConnection,
        handle: SubscriptionHandle,
    ) -> Result<(), TransportError> {
        connection.shared.subscribers.remove(&handle.id);
        if !connection.is_connected() {
            debug!(channel = %handle.channel.name, "connection already lost, nothing to unsubscribe");
            return Ok(());
        }
        connection
            .shared
            .send(&ClientFrame::Unsubscribe {
                key: &handle.channel.key,
                channel: &handle.channel.name,
            })
            .await
    }

    async fn close(&self, connection: WsConnection) {
        let shared = &connection.shared;
        shared.closing.store(true, Ordering::Release);
        shared.subscribers.clear();

        let writer = shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.send(Message::Close(None)).await {
                debug!(error = %e, "close frame not sent");
            }
        }
        connection.reader.abort();
    }
}
