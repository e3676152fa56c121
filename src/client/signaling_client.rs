use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::error::{ProctorError, Result};
use crate::peer::{ReconnectPolicy, SignalSink};
use crate::protocol::{now_millis, ClientMessage, ServerMessage, Signal, WebRtcSignal};

const JOIN_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const LEAVE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Debug, Clone)]
struct JoinParams {
    url: String,
    room_id: String,
    user_id: String,
    is_admin: bool,
}

impl JoinParams {
    fn join_message(&self) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            is_admin: self.is_admin,
        }
    }
}

/// How one socket's lifetime ended.
enum SocketEnd {
    /// `leave-room` went out, or the client was dropped.
    Left,
    /// The transport went away underneath us.
    Dropped,
}

async fn send_frame(write: &mut WsWrite, message: &ClientMessage) -> Result<()> {
    let text = message.to_json()?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| ProctorError::network(e.to_string()))
}

/// Open a socket, send `join-room` and wait for the relay's ack. Frames
/// that arrive ahead of the ack are passed through unchanged.
async fn open_and_join(
    params: &JoinParams,
    inbound: &mpsc::UnboundedSender<ServerMessage>,
) -> Result<(WsWrite, WsRead)> {
    let (ws_stream, _) = connect_async(params.url.as_str())
        .await
        .map_err(|e| ProctorError::network(format!("{}: {}", params.url, e)))?;
    let (mut write, mut read) = ws_stream.split();
    send_frame(&mut write, &params.join_message()).await?;

    let acked = timeout(JOIN_ACK_TIMEOUT, async {
        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(ProctorError::network(e.to_string())),
            };
            match ServerMessage::parse(&text) {
                Ok(ServerMessage::RoomJoined { room_id, .. }) if room_id == params.room_id => return Ok(()),
                Ok(ServerMessage::RoomError { message }) => return Err(ProctorError::InvalidRequest(message)),
                Ok(other) => {
                    let _ = inbound.send(other);
                }
                Err(e) => tracing::warn!(error = %e, raw_message = %text, "Dropping unparsable frame"),
            }
        }
        Err(ProctorError::ChannelClosed)
    })
    .await;

    match acked {
        Ok(Ok(())) => Ok((write, read)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProctorError::network("timed out waiting for room-joined")),
    }
}

/// Pump one joined socket until it drops or the client leaves. This task
/// is the only writer, so frames leave in the order they were queued.
async fn pump_socket(
    mut write: WsWrite,
    mut read: WsRead,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    inbound: &mpsc::UnboundedSender<ServerMessage>,
) -> SocketEnd {
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = write.close().await;
                    return SocketEnd::Left;
                };
                let leaving = matches!(message, ClientMessage::LeaveRoom { .. });
                if let Err(e) = send_frame(&mut write, &message).await {
                    tracing::debug!(error = %e, "Signaling socket closed while sending");
                    return if leaving { SocketEnd::Left } else { SocketEnd::Dropped };
                }
                if leaving {
                    let _ = write.close().await;
                    return SocketEnd::Left;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            let _ = write.close().await;
                            return SocketEnd::Left;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, raw_message = %text, "Dropping unparsable frame"),
                },
                Some(Ok(Message::Close(_))) | None => return SocketEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Signaling socket error");
                    return SocketEnd::Dropped;
                }
            }
        }
    }
}

/// Owns the connection for the client's whole life: pumps the joined
/// socket and, when the transport drops, reconnects and rejoins with
/// backoff. A successful rejoin is reported to the caller as `room-joined`.
async fn supervise(
    params: JoinParams,
    policy: ReconnectPolicy,
    write: WsWrite,
    read: WsRead,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
) {
    let mut socket = Some((write, read));
    loop {
        let Some((write, read)) = socket.take() else {
            break;
        };
        if let SocketEnd::Left = pump_socket(write, read, &mut outbound, &inbound).await {
            break;
        }

        tracing::warn!(room_id = %params.room_id, user_id = %params.user_id, "Signaling socket dropped, reconnecting");
        let mut attempt = 0;
        while attempt < policy.max_attempts {
            attempt += 1;
            let delay = policy.delay_for(attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling signaling reconnect");
            tokio::time::sleep(delay).await;

            match open_and_join(&params, &inbound).await {
                Ok(joined) => {
                    tracing::info!(room_id = %params.room_id, attempt, "Rejoined signaling room");
                    let rejoined = ServerMessage::RoomJoined {
                        room_id: params.room_id.clone(),
                        user_id: params.user_id.clone(),
                        is_admin: params.is_admin,
                    };
                    if inbound.send(rejoined).is_ok() {
                        socket = Some(joined);
                    }
                    break;
                }
                Err(e @ ProctorError::InvalidRequest(_)) => {
                    tracing::error!(error = %e, "Relay refused the rejoin");
                    break;
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Signaling reconnect failed"),
            }
        }
        if socket.is_none() {
            tracing::error!(room_id = %params.room_id, attempts = attempt, "Giving up on signaling connection");
        }
    }
    tracing::debug!(room_id = %params.room_id, "Signaling connection finished");
}

/// A joined signaling connection.
///
/// Inbound frames are handed to the caller on the receiver returned by
/// `connect`. The receiver stays open across transport drops; it only
/// closes once the client leaves or reconnection is exhausted. Every
/// rejoin after a drop shows up on it as another `room-joined`.
pub struct SignalingClient {
    room_id: String,
    user_id: String,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect, join `room_id` and wait for the relay's acknowledgment.
    pub async fn connect(
        url: &str,
        room_id: &str,
        user_id: &str,
        is_admin: bool,
        heartbeat_interval: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        Self::connect_with_policy(url, room_id, user_id, is_admin, heartbeat_interval, ReconnectPolicy::default()).await
    }

    /// Like `connect`, with an explicit budget for reconnecting after the
    /// transport drops. The first join is never retried.
    pub async fn connect_with_policy(
        url: &str,
        room_id: &str,
        user_id: &str,
        is_admin: bool,
        heartbeat_interval: Duration,
        policy: ReconnectPolicy,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        let params = JoinParams {
            url: url.to_string(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            is_admin,
        };
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let (write, read) = open_and_join(&params, &inbound_tx).await?;
        tracing::info!(room_id = %room_id, user_id = %user_id, is_admin, "Joined signaling room");

        let connection = tokio::spawn(supervise(params, policy, write, read, outbound_rx, inbound_tx));

        let heartbeat = {
            let outbound = outbound.clone();
            let room_id = room_id.to_string();
            let user_id = user_id.to_string();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(heartbeat_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let beat = ClientMessage::Heartbeat {
                        room_id: Some(room_id.clone()),
                        user_id: Some(user_id.clone()),
                        timestamp: now_millis(),
                    };
                    if outbound.send(beat).is_err() {
                        break;
                    }
                }
            })
        };

        let client = Self {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            outbound,
            tasks: Mutex::new(vec![connection, heartbeat]),
        };
        Ok((client, inbound_rx))
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn send_message(&self, message: ClientMessage) -> Result<()> {
        self.outbound.send(message).map_err(|_| ProctorError::ChannelClosed)
    }

    pub fn send_signal(&self, to_id: Option<&str>, signal: Signal) -> Result<()> {
        self.send_message(ClientMessage::WebrtcSignal(WebRtcSignal {
            room_id: self.room_id.clone(),
            from_id: self.user_id.clone(),
            to_id: to_id.map(str::to_string),
            signal,
            timestamp: now_millis(),
        }))
    }

    /// Send `leave-room` and stop the background tasks once it is flushed.
    pub async fn leave(&self) {
        let _ = self.send_message(ClientMessage::LeaveRoom {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
        });

        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => return,
        };
        let mut tasks = tasks.into_iter();
        let connection = tasks.next();
        for task in tasks {
            task.abort();
        }
        if let Some(mut connection) = connection {
            if timeout(LEAVE_FLUSH_TIMEOUT, &mut connection).await.is_err() {
                tracing::debug!(room_id = %self.room_id, "Leave frame not flushed in time");
                connection.abort();
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl SignalSink for SignalingClient {
    async fn send(&self, to: &str, signal: Signal) -> Result<()> {
        self.send_signal(Some(to), signal)
    }
}
