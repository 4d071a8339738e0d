use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use ember_auth::CredentialSource;
use ember_types::Topic;
use ember_types::events::decode_frame;

use crate::channel::{
    ABNORMAL_CLOSURE, ChannelEvent, ChannelState, CloseInfo, Control, Envelope, NO_STATUS_CLOSURE,
    NORMAL_CLOSURE, REASON_DISABLED, REASON_TOPIC_CHANGE, REASON_UNMOUNT, Shared,
    UNAUTHORIZED_CLOSURE,
};
use crate::config::{GatewayConfig, bearer_subprotocol};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;
type Stream = SplitStream<Socket>;

/// Raw text kept in the log when a frame fails to decode.
const LOGGED_FRAME_CHARS: usize = 200;

/// How a connection cycle ended.
enum CycleEnd {
    /// Owner is gone; the driver exits.
    Shutdown,
    /// Topic changed while enabled; connect again right away.
    Reconnect,
    /// Disabled, or closed by the server or network. Wait for `Enable`.
    Stopped,
}

/// Per-channel task. Owns the socket; everything else talks to it through
/// the control queue and the shared state.
pub(crate) struct Driver {
    pub id: Uuid,
    pub topic: Topic,
    pub enabled: bool,
    pub config: Arc<GatewayConfig>,
    pub credentials: Arc<dyn CredentialSource>,
    pub shared: Arc<Shared>,
    pub control: mpsc::UnboundedReceiver<Control>,
    pub events: mpsc::UnboundedSender<Envelope>,
    pub cancel: CancellationToken,
}

impl Driver {
    pub async fn run(mut self) {
        debug!(
            channel = %self.id,
            topic = %self.topic,
            enabled = self.enabled,
            "Channel driver started"
        );

        'driver: loop {
            if self.enabled {
                match self.cycle().await {
                    CycleEnd::Shutdown => break 'driver,
                    CycleEnd::Reconnect => continue 'driver,
                    CycleEnd::Stopped => {}
                }
            }

            // Not connected: wait for something that starts a new cycle
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'driver,
                    control = self.control.recv() => match control {
                        None => break 'driver,
                        Some(Control::Enable) => {
                            self.enabled = true;
                            continue 'driver;
                        }
                        Some(Control::Disable) => self.enabled = false,
                        Some(Control::Topic(topic)) => self.topic = topic,
                        Some(Control::Send(_)) => {
                            trace!(channel = %self.id, "Dropping send on a closed channel");
                        }
                    },
                }
            }
        }

        self.shared.set_state(ChannelState::Closed);
        debug!(channel = %self.id, topic = %self.topic, "Channel driver stopped");
    }

    fn emit(&self, generation: u64, event: ChannelEvent) {
        let _ = self.events.send(Envelope { generation, event });
    }

    fn transition(&self, state: ChannelState) {
        debug!(channel = %self.id, topic = %self.topic, %state, "Channel state");
        self.shared.set_state(state);
    }

    /// Emit `Closed` first so an owner that sees the state change can rely on
    /// the event already being queued.
    fn finish(&self, generation: u64, close: CloseInfo) {
        if close.is_normal() {
            info!(
                channel = %self.id,
                topic = %self.topic,
                reason = %close.reason,
                "Channel closed"
            );
        } else {
            warn!(
                channel = %self.id,
                topic = %self.topic,
                code = close.code,
                reason = %close.reason,
                "Channel closed abnormally"
            );
        }
        self.emit(generation, ChannelEvent::Closed(close));
        self.transition(ChannelState::Closed);
    }

    async fn cycle(&mut self) -> CycleEnd {
        let generation = self.shared.generation();
        self.transition(ChannelState::Connecting);

        let connect = open_socket(
            self.config.clone(),
            self.topic.clone(),
            self.credentials.clone(),
        );
        tokio::pin!(connect);

        let socket = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.finish(generation, CloseInfo::new(NORMAL_CLOSURE, REASON_UNMOUNT));
                    return CycleEnd::Shutdown;
                }
                control = self.control.recv() => match control {
                    None => {
                        self.finish(generation, CloseInfo::new(NORMAL_CLOSURE, REASON_UNMOUNT));
                        return CycleEnd::Shutdown;
                    }
                    Some(Control::Disable) => {
                        self.enabled = false;
                        self.finish(generation, CloseInfo::new(NORMAL_CLOSURE, REASON_DISABLED));
                        return CycleEnd::Stopped;
                    }
                    Some(Control::Topic(topic)) => {
                        self.topic = topic;
                        let close = CloseInfo::new(NORMAL_CLOSURE, REASON_TOPIC_CHANGE);
                        self.finish(generation, close);
                        return CycleEnd::Reconnect;
                    }
                    Some(Control::Enable) | Some(Control::Send(_)) => {}
                },
                result = &mut connect => match result {
                    Ok(socket) => break socket,
                    Err(close) => {
                        self.finish(generation, close);
                        return CycleEnd::Stopped;
                    }
                },
            }
        };

        self.transition(ChannelState::Open);
        info!(channel = %self.id, topic = %self.topic, "Channel open");
        self.emit(generation, ChannelEvent::Open);

        let (mut sink, mut stream) = socket.split();
        let kind = self.topic.kind();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.close(sink, stream, generation, REASON_UNMOUNT).await;
                    return CycleEnd::Shutdown;
                }
                control = self.control.recv() => match control {
                    None => {
                        self.close(sink, stream, generation, REASON_UNMOUNT).await;
                        return CycleEnd::Shutdown;
                    }
                    Some(Control::Disable) => {
                        self.enabled = false;
                        self.close(sink, stream, generation, REASON_DISABLED).await;
                        return CycleEnd::Stopped;
                    }
                    Some(Control::Topic(topic)) => {
                        self.close(sink, stream, generation, REASON_TOPIC_CHANGE).await;
                        self.topic = topic;
                        return CycleEnd::Reconnect;
                    }
                    Some(Control::Send(frame)) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(channel = %self.id, "Could not encode outbound frame: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!(channel = %self.id, "Send failed: {}", e);
                            let close = CloseInfo::new(ABNORMAL_CLOSURE, e.to_string());
                            self.finish(generation, close);
                            return CycleEnd::Stopped;
                        }
                    }
                    Some(Control::Enable) => {}
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match decode_frame(kind, text.as_str()) {
                        Ok(frame) => self.emit(generation, ChannelEvent::Frame(frame)),
                        Err(e) => {
                            let preview: String =
                                text.as_str().chars().take(LOGGED_FRAME_CHARS).collect();
                            warn!(
                                channel = %self.id,
                                topic = %self.topic,
                                "Dropping malformed frame: {} ({})",
                                e,
                                preview
                            );
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let close = match frame {
                            Some(frame) => {
                                CloseInfo::new(u16::from(frame.code), frame.reason.as_str())
                            }
                            None => CloseInfo::new(NO_STATUS_CLOSURE, ""),
                        };
                        self.transition(ChannelState::Closing);
                        let _ = sink.close().await;
                        self.finish(generation, close);
                        return CycleEnd::Stopped;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(channel = %self.id, "Ignoring binary frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.finish(generation, CloseInfo::new(ABNORMAL_CLOSURE, e.to_string()));
                        return CycleEnd::Stopped;
                    }
                    None => {
                        let close = CloseInfo::new(ABNORMAL_CLOSURE, "connection lost");
                        self.finish(generation, close);
                        return CycleEnd::Stopped;
                    }
                },
            }
        }
    }

    /// Caller-initiated close: send 1000 and wait briefly for the server's
    /// echo. Frames still arriving are discarded.
    async fn close(&self, mut sink: Sink, mut stream: Stream, generation: u64, reason: &str) {
        self.transition(ChannelState::Closing);

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(channel = %self.id, "Close frame not sent: {}", e);
        } else {
            let drain = async {
                while let Some(Ok(msg)) = stream.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
            };
            if tokio::time::timeout(self.config.close_timeout, drain).await.is_err() {
                debug!(channel = %self.id, "Server did not acknowledge close in time");
            }
        }

        self.finish(generation, CloseInfo::new(NORMAL_CLOSURE, reason));
    }
}

/// Resolve the credential and perform the handshake. Failures map straight
/// to the close the owner will see.
async fn open_socket(
    config: Arc<GatewayConfig>,
    topic: Topic,
    credentials: Arc<dyn CredentialSource>,
) -> Result<Socket, CloseInfo> {
    let Some(token) = credentials.access_token().await else {
        return Err(CloseInfo::new(UNAUTHORIZED_CLOSURE, "no credential"));
    };

    let url = config
        .channel_url(&topic)
        .map_err(|e| CloseInfo::new(ABNORMAL_CLOSURE, e.to_string()))?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| CloseInfo::new(ABNORMAL_CLOSURE, e.to_string()))?;
    let protocol = HeaderValue::from_str(&bearer_subprotocol(&token))
        .map_err(|_| {
            CloseInfo::new(UNAUTHORIZED_CLOSURE, "credential is not a valid header value")
        })?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

    match connect_async(request).await {
        Ok((socket, _response)) => Ok(socket),
        Err(WsError::Http(response)) => Err(CloseInfo::new(
            ABNORMAL_CLOSURE,
            format!("handshake rejected with status {}", response.status()),
        )),
        Err(e) => Err(CloseInfo::new(ABNORMAL_CLOSURE, e.to_string())),
    }
}
