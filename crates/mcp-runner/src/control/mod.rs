//! Control-plane link.
//!
//! A single outbound WebSocket over which the control plane assigns jobs.
//! The link reconnects on transport failures; sessions keep running while it
//! is down and whatever they produce is delivered once it is back.

mod handler;

pub use handler::RunnerHandler;

use anyhow::{Context, Result, anyhow, bail};
use futures::{Sink, SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use mcp_runner_protocol::{RunnerToServer, ServerToRunner};

use crate::config::ControlConfig;

/// Path of the runner endpoint on the control plane.
pub const CONNECT_PATH: &str = "/runner/connect";

type ControlSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How a connection ended without a transport error.
#[derive(Debug)]
enum Disconnect {
    /// The server sent a close frame.
    Closed(Option<String>),
    /// The stream ended without one.
    Dropped,
}

pub struct ControlLink {
    config: ControlConfig,
    url: String,
    connection_key: String,
    handler: Arc<RunnerHandler>,
    outbound: Mutex<mpsc::UnboundedReceiver<RunnerToServer>>,
    /// Message whose send failed; goes out first after reconnecting.
    unsent: Mutex<Option<String>>,
}

impl ControlLink {
    pub fn new(
        config: ControlConfig,
        handler: Arc<RunnerHandler>,
        outbound: mpsc::UnboundedReceiver<RunnerToServer>,
    ) -> Result<Self> {
        let base = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("control.url is not configured"))?;
        let connection_key = config
            .connection_key
            .clone()
            .ok_or_else(|| anyhow!("control.connection_key is not configured"))?;

        Ok(Self {
            url: format!("{}{}", base.trim_end_matches('/'), CONNECT_PATH),
            connection_key,
            config,
            handler,
            outbound: Mutex::new(outbound),
            unsent: Mutex::new(None),
        })
    }

    /// Keep the link up. Returns only with an error: the server closed the
    /// connection or the reconnect budget is exhausted.
    pub async fn run(&self) -> Result<()> {
        let mut failures: u32 = 0;

        loop {
            match self.connect().await {
                Ok(socket) => {
                    info!("Connected to control plane at {}", self.url);
                    failures = 0;
                    match self.serve(socket).await {
                        Ok(Disconnect::Closed(reason)) => {
                            bail!(
                                "control plane closed the connection: {}",
                                reason.as_deref().unwrap_or("no reason given")
                            );
                        }
                        Ok(Disconnect::Dropped) => warn!("Control plane connection dropped"),
                        Err(e) => warn!("Control plane connection failed: {:#}", e),
                    }
                }
                Err(e) => warn!("Failed to connect to control plane: {:#}", e),
            }

            failures += 1;
            if failures > self.config.max_reconnect_attempts {
                bail!(
                    "giving up on control plane after {} failed attempts",
                    failures
                );
            }

            let backoff = self.config.reconnect_delay(failures);
            debug!(
                "Reconnecting to control plane (attempt {}) in {:?}",
                failures, backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn connect(&self) -> Result<ControlSocket> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("invalid control plane url")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.connection_key))
            .context("connection key is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let (socket, _response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| anyhow!("timed out after {:?}", timeout))??;
        Ok(socket)
    }

    async fn serve(&self, socket: ControlSocket) -> Result<Disconnect> {
        let (mut sink, mut stream) = socket.split();
        let mut outbound = self.outbound.lock().await;

        let unsent = self.unsent.lock().await.take();
        if let Some(text) = unsent {
            self.send_text(&mut sink, text).await?;
        }

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()).await,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()));
                        return Ok(Disconnect::Closed(reason));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring {} byte binary frame from control plane", data.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(Disconnect::Dropped),
                },
                Some(message) = outbound.recv() => {
                    let text = serde_json::to_string(&message)
                        .context("serializing control plane message")?;
                    self.send_text(&mut sink, text).await?;
                }
            }
        }
    }

    async fn send_text<S>(&self, sink: &mut S, text: String) -> Result<()>
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        if let Err(e) = sink.send(Message::Text(text.clone().into())).await {
            *self.unsent.lock().await = Some(text);
            return Err(e.into());
        }
        Ok(())
    }

    async fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ServerToRunner>(text) {
            Ok(message) => self.handler.handle(message).await,
            Err(e) => warn!("Unrecognized control plane message: {}", e),
        }
    }
}
