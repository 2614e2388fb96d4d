use std::time::Duration;

use api_types::{Collection, Record, change::ChangeEvent};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt, future::BoxFuture, stream};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{
    ChangeFeed, ChangeStream,
    protocol::{self, Frame, Incoming},
};
use crate::{client::ClientHandle, error::SubscriptionError};

const JOIN_REF: &str = "1";
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);

type Item<T> = Result<ChangeEvent<T>, SubscriptionError>;

/// [`ChangeFeed`] over the realtime websocket of the hosted service.
///
/// Every `open` dials a fresh socket and joins one channel. The socket is
/// driven by a background task that forwards decoded changes and sends
/// heartbeats. A heartbeat still unanswered at the next tick counts as a
/// lost socket. The task leaves the channel once the returned stream is
/// dropped.
#[derive(Clone, Debug)]
pub struct WebSocketFeed {
    client: ClientHandle,
    heartbeat: Duration,
}

impl WebSocketFeed {
    pub fn new(client: ClientHandle) -> Self {
        Self {
            client,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

impl<T: Record> ChangeFeed<T> for WebSocketFeed {
    fn open(
        &self,
        collection: Collection,
    ) -> BoxFuture<'static, Result<ChangeStream<T>, SubscriptionError>> {
        open_channel::<T>(self.client.clone(), collection, self.heartbeat).boxed()
    }
}

async fn open_channel<T: Record>(
    client: ClientHandle,
    collection: Collection,
    heartbeat: Duration,
) -> Result<ChangeStream<T>, SubscriptionError> {
    let url = client
        .realtime_url()
        .map_err(|err| SubscriptionError::Connect(err.to_string()))?;
    let (socket, _) = connect_async(url.as_str())
        .await
        .map_err(|err| SubscriptionError::Connect(err.to_string()))?;
    let (mut sink, mut source) = socket.split();

    let topic = protocol::topic(collection);
    send_frame(
        &mut sink,
        &Frame::join(collection, &client.bearer_token(), JOIN_REF),
    )
    .await?;
    await_join::<T, _>(&mut source, &topic).await?;
    tracing::info!(%collection, "joined realtime channel");

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(pump::<T, _, _>(sink, source, topic, tx, heartbeat));

    Ok(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed())
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), SubscriptionError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = frame.encode()?;
    sink.send(Message::text(text))
        .await
        .map_err(|err| SubscriptionError::Dropped(err.to_string()))
}

/// Reads until the server answers the join. Changes cannot arrive before the
/// reply, anything else is skipped.
async fn await_join<T, R>(source: &mut R, topic: &str) -> Result<(), SubscriptionError>
where
    T: Record,
    R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = source.next().await {
        let message = message.map_err(|err| SubscriptionError::Connect(err.to_string()))?;
        let Message::Text(text) = message else {
            continue;
        };
        match protocol::interpret::<T>(&Frame::decode(text.as_str())?, topic)? {
            Incoming::JoinAccepted => return Ok(()),
            Incoming::JoinRejected(reason) => return Err(SubscriptionError::Rejected(reason)),
            Incoming::Closed(reason) => return Err(SubscriptionError::Rejected(reason)),
            Incoming::Change(_) | Incoming::Ignored => {}
        }
    }
    Err(SubscriptionError::Connect(
        "socket closed before join reply".to_string(),
    ))
}

async fn pump<T, S, R>(
    mut sink: S,
    mut source: R,
    topic: String,
    tx: mpsc::UnboundedSender<Item<T>>,
    heartbeat: Duration,
) where
    T: Record,
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send,
    R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin + Send,
{
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut next_ref: u64 = 2;
    // Ref of the last heartbeat still waiting for its reply.
    let mut unanswered: Option<String> = None;

    loop {
        tokio::select! {
            _ = tx.closed() => break,
            _ = ticker.tick() => {
                if unanswered.is_some() {
                    tracing::warn!(%topic, "heartbeat not answered, dropping socket");
                    let _ = tx.send(Err(SubscriptionError::Dropped(
                        "heartbeat timeout".to_string(),
                    )));
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                let reference = next_ref.to_string();
                next_ref += 1;
                if let Err(err) = send_frame(&mut sink, &Frame::heartbeat(&reference)).await {
                    let _ = tx.send(Err(err));
                    return;
                }
                unanswered = Some(reference);
            }
            message = source.next() => {
                let item = match message {
                    Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                        Ok(frame)
                            if unanswered
                                .as_deref()
                                .is_some_and(|reference| frame.acknowledges(reference)) =>
                        {
                            unanswered = None;
                            None
                        }
                        Ok(frame) => match protocol::interpret::<T>(&frame, &topic) {
                            Ok(Incoming::Change(event)) => Some(Ok(event)),
                            Ok(Incoming::Closed(reason)) => {
                                let _ = tx.send(Err(SubscriptionError::Dropped(reason)));
                                return;
                            }
                            Ok(_) => None,
                            Err(err) => Some(Err(err)),
                        },
                        Err(err) => Some(Err(err)),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = tx.send(Err(SubscriptionError::Dropped(
                            "socket closed".to_string(),
                        )));
                        return;
                    }
                    Some(Ok(_)) => None,
                    Some(Err(err)) => {
                        let _ = tx.send(Err(SubscriptionError::Dropped(err.to_string())));
                        return;
                    }
                };
                if let Some(item) = item
                    && tx.send(item).is_err()
                {
                    break;
                }
            }
        }
    }

    tracing::debug!(%topic, "leaving realtime channel");
    let leave = Frame::leave(&topic, &next_ref.to_string());
    let _ = send_frame(&mut sink, &leave).await;
    let _ = sink.send(Message::Close(None)).await;
}
