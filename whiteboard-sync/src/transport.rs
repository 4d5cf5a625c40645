//! WebSocket connection to the relay.
//!
//! One writer task drains an outgoing channel into the socket; one reader task
//! decodes incoming text frames into [`RelayMessage`]s. Either side ending
//! closes the connection: the inbound channel closes when the reader stops,
//! and [`RelayConnection::is_open`] turns false when the writer stops.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ProtocolError, RelayMessage};

/// An open relay connection.
pub struct RelayConnection {
    outgoing: mpsc::Sender<RelayMessage>,
    reader: JoinHandle<()>,
}

impl RelayConnection {
    /// Connect to `url` and start the reader and writer tasks.
    ///
    /// Returns the connection and the stream of frames from the relay.
    pub async fn open(
        url: &str,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<RelayMessage>), ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<RelayMessage>(capacity);
        let (in_tx, in_rx) = mpsc::channel::<RelayMessage>(capacity);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Dropping unencodable {} frame: {e}", msg.event_name());
                        continue;
                    }
                };
                if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                    log::warn!("Relay write failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match RelayMessage::decode(text.as_str()) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::warn!("Relay read failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            log::debug!("Relay reader finished");
        });

        Ok((
            Self {
                outgoing: out_tx,
                reader,
            },
            in_rx,
        ))
    }

    /// Queue a frame, waiting for room in the outgoing channel.
    pub async fn send(&self, msg: RelayMessage) -> Result<(), ProtocolError> {
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, msg: RelayMessage) -> Result<(), mpsc::error::TrySendError<RelayMessage>> {
        self.outgoing.try_send(msg)
    }

    /// Whether the writer is still accepting frames.
    pub fn is_open(&self) -> bool {
        !self.outgoing.is_closed() && !self.reader.is_finished()
    }

    /// Close the socket. Frames already queued are still flushed.
    pub fn close(self) {
        drop(self.outgoing);
        self.reader.abort();
    }
}
