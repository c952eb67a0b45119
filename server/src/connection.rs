//! One client's session: an outbound queue plus a reader and a writer duty

use crate::hub::{ConnectionId, HubHandle, Member};
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// How long the writer waits for a close frame to go out before giving up
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// A live connection that has not started its duties yet
///
/// The hub holds the matching [`Member`]; the connection keeps the consumer
/// end of the outbound queue and a token that closes both duties. The hub
/// fires the same token when it removes or evicts the connection.
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Receiver<Message>,
    closed: CancellationToken,
}

impl Connection {
    /// Creates a connection and the member to register with the hub
    pub fn new(queue_capacity: usize) -> (Self, Member<Message>) {
        let (member, outbound) = Member::channel(queue_capacity.max(1));
        let connection = Self {
            id: member.id(),
            outbound,
            closed: member.close_token(),
        };
        (connection, member)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Runs both duties over an already split stream until the connection ends
    ///
    /// The writer runs on its own task so a stalled write never holds up
    /// reading. Returns once both duties have exited and the sink is closed.
    pub async fn serve<S, K>(self, stream: S, sink: K, hub: HubHandle<Message>)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
        K: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    {
        let Connection {
            id,
            outbound,
            closed,
        } = self;

        let writer = tokio::spawn(write_loop(id, sink, outbound, closed.clone()));
        read_loop(id, stream, &hub, &closed).await;

        if let Err(e) = writer.await {
            warn!("Writer for connection {} panicked: {}", id, e);
        }
        info!("Connection {} closed", id);
    }
}

/// Relays every data frame from the client to the hub
///
/// Stops on the first receive error, a close frame, end of stream, or when
/// the writer has closed the connection. Always asks the hub to remove the
/// connection on the way out.
async fn read_loop<S>(
    id: ConnectionId,
    mut stream: S,
    hub: &HubHandle<Message>,
    closed: &CancellationToken,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                let submitted = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    result = hub.broadcast(id, msg) => result,
                };
                if submitted.is_err() {
                    warn!("Hub stopped, dropping connection {}", id);
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!("Connection {} closed by peer", id);
                break;
            }
            // Pings are answered by the WebSocket layer
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(e)) => {
                debug!("Read error on connection {}: {}", id, e);
                break;
            }
        }
    }

    closed.cancel();
    if hub.unregister(id).await.is_err() {
        debug!("Hub stopped before connection {} was removed", id);
    }
}

/// Writes queued messages to the client until the queue closes or a write fails
///
/// Anything still queued when the connection closes is discarded, and a
/// write stuck on a client that stopped reading is abandoned.
async fn write_loop<K>(
    id: ConnectionId,
    mut sink: K,
    mut outbound: mpsc::Receiver<Message>,
    closed: CancellationToken,
) where
    K: Sink<Message, Error = axum::Error> + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => {
                    debug!("Outbound queue for connection {} closed", id);
                    break;
                }
            },
        };

        let written = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            result = sink.send(msg) => result,
        };
        if let Err(e) = written {
            debug!("Write error on connection {}: {}", id, e);
            break;
        }
    }

    closed.cancel();
    // Closing twice or after a failed write is fine
    if timeout(CLOSE_GRACE, sink.close()).await.is_err() {
        debug!("Connection {} did not accept a close frame", id);
    }
}
