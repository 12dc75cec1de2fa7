//! Transport seam between the session and the wire
//!
//! A [`Connector`] produces a [`Connection`]: a sender for outbound frames and
//! a receiver of [`TransportEvent`]s. The production connector runs a writer
//! task and a reader task over a WebSocket.

use crate::error::{SessionError, SessionResult};
use crate::protocol::{ABNORMAL_CLOSE_CODE, NORMAL_CLOSE_CODE};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Capacity of the per-connection frame channels
pub const TRANSPORT_CHANNEL_CAPACITY: usize = 100;

/// Frame queued for the writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Close with the given code; the writer stops afterwards
    Close(u16),
}

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed { code: u16 },
    /// Read failure; `refused` marks a refused connection, which gets no close event
    Error { message: String, refused: bool },
}

/// An established connection
pub struct Connection {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to a URL
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> SessionResult<Connection>;
}

/// WebSocket connector
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> SessionResult<Connection> {
        let (ws, _) = connect_async(url).await.map_err(|e| classify_connect_error(url, e))?;
        let (sink, stream) = ws.split();

        let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(TRANSPORT_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(TRANSPORT_CHANNEL_CAPACITY);

        tokio::spawn(writer_task(sink, out_rx));
        tokio::spawn(reader_task(stream, in_tx));

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn classify_connect_error(url: &str, err: WsError) -> SessionError {
    match &err {
        WsError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            SessionError::connection_refused(url, io.to_string())
        }
        _ => SessionError::ConnectionFailed(format!("Failed to connect to {}: {}", url, err)),
    }
}

/// Writer task - sends queued frames until the channel closes or a close is sent
async fn writer_task<S>(mut sink: S, mut rx: mpsc::Receiver<OutboundFrame>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let (message, last) = match frame {
            OutboundFrame::Text(text) => (Message::Text(text.into()), false),
            OutboundFrame::Close(code) => (
                Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: String::new().into(),
                })),
                true,
            ),
        };
        if let Err(e) = sink.send(message).await {
            tracing::error!("Session write error: {}", e);
            break;
        }
        if last {
            break;
        }
    }
}

/// Reader task - forwards text frames and reports how the socket ended
async fn reader_task<S>(mut stream: S, tx: mpsc::Sender<TransportEvent>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut close_code = ABNORMAL_CLOSE_CODE;

    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => {
                if tx.send(TransportEvent::Message(text.to_string())).await.is_err() {
                    // Session detached this connection
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| u16::from(f.code)).unwrap_or(NORMAL_CLOSE_CODE);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Session read error: {}", e);
                let refused = matches!(&e, WsError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused);
                let _ = tx
                    .send(TransportEvent::Error {
                        message: e.to_string(),
                        refused,
                    })
                    .await;
                if refused {
                    return;
                }
                break;
            }
        }
    }

    let _ = tx.send(TransportEvent::Closed { code: close_code }).await;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connector driven by the test body

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Server side of one in-memory connection
    pub(crate) struct ServerEnd {
        pub url: String,
        pub from_client: mpsc::Receiver<OutboundFrame>,
        pub to_client: mpsc::Sender<TransportEvent>,
    }

    /// Hands out connections and lets the test script refusals
    pub(crate) struct ChannelConnector {
        accepted: mpsc::UnboundedSender<ServerEnd>,
        refusals: AtomicUsize,
        attempts: Mutex<Vec<String>>,
    }

    impl ChannelConnector {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
            let (accepted, rx) = mpsc::unbounded_channel();
            (
                Self {
                    accepted,
                    refusals: AtomicUsize::new(0),
                    attempts: Mutex::new(Vec::new()),
                },
                rx,
            )
        }

        /// Refuse the next connection attempt
        pub(crate) fn refuse_next(&self) {
            self.refusals.fetch_add(1, Ordering::SeqCst);
        }

        pub(crate) fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for ChannelConnector {
        async fn connect(&self, url: &str) -> SessionResult<Connection> {
            self.attempts.lock().unwrap().push(url.to_string());
            let refuse = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refuse {
                return Err(SessionError::connection_refused(url, "refused by test"));
            }

            let (out_tx, out_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
            let _ = self.accepted.send(ServerEnd {
                url: url.to_string(),
                from_client: out_rx,
                to_client: in_tx,
            });
            Ok(Connection {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_reader_reports_close_code() {
        let frames = stream::iter(vec![
            Ok(Message::Text("pong".to_string().into())),
            Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "going away".to_string().into(),
            }))),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        reader_task(frames, tx).await;

        assert_eq!(rx.recv().await, Some(TransportEvent::Message("pong".to_string())));
        assert_eq!(rx.recv().await, Some(TransportEvent::Closed { code: 1001 }));
    }

    #[tokio::test]
    async fn test_reader_reports_abnormal_end() {
        let frames = stream::iter(Vec::<Result<Message, WsError>>::new());
        let (tx, mut rx) = mpsc::channel(8);
        reader_task(frames, tx).await;

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Closed {
                code: ABNORMAL_CLOSE_CODE
            })
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_classified() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify_connect_error("ws://127.0.0.1:9", WsError::Io(io));
        assert!(matches!(err, SessionError::ConnectionRefused { .. }));

        let err = classify_connect_error("ws://127.0.0.1:9", WsError::ConnectionClosed);
        assert!(matches!(err, SessionError::ConnectionFailed(_)));
    }
}
