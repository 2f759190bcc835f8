use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::error::WebSocketError;
use crate::websocket::message::{Frame, Message};
use crate::websocket::registry::{RegistryHandle, SessionHandle, SessionRef};

const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(54);
const WRITE_WAIT: Duration = Duration::from_secs(10);
const SEND_QUEUE_CAPACITY: usize = 256;

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub send_queue_capacity: usize,
    /// Longest silence tolerated from the peer before the connection is considered dead.
    pub pong_wait: Duration,
    /// Must stay below `pong_wait`.
    pub ping_interval: Duration,
    pub write_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: SEND_QUEUE_CAPACITY,
            pong_wait: PONG_WAIT,
            ping_interval: PING_INTERVAL,
            write_wait: WRITE_WAIT,
        }
    }
}

/// One live signaling connection.
///
/// The socket is split in two halves, each owned by its own pump: the
/// inbound pump reads and hands messages to the registry, the outbound pump
/// is the only writer and drains the bounded queue the registry fills.
pub struct Session {
    session: SessionRef,
    config: SessionConfig,
}

impl Session {
    pub fn new(user_id: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            session: SessionRef::new(user_id),
            config,
        }
    }

    pub fn session_ref(&self) -> &SessionRef {
        &self.session
    }

    /// Register with the registry and pump the socket until either side gives up.
    ///
    /// Unregister is submitted exactly once on the way out, whatever ended the session.
    pub async fn run<K, S, E>(self, sink: K, stream: S, registry: RegistryHandle) -> Result<(), WebSocketError>
    where
        K: Sink<WsMessage> + Unpin + Send + 'static,
        K::Error: Display + Send,
        S: Stream<Item = Result<WsMessage, E>> + Unpin,
        E: Display,
    {
        let Session { session, config } = self;
        let (tx, rx) = mpsc::channel(config.send_queue_capacity);

        registry
            .register(SessionHandle::new(session.clone(), tx))
            .await?;
        info!(user_id = %session.user_id, session_id = %session.id, "Session started");

        let mut writer = tokio::spawn(outbound_pump(sink, rx, config.clone()));
        let reader = inbound_pump(stream, session.clone(), registry.clone(), config.pong_wait);
        tokio::pin!(reader);

        let result = tokio::select! {
            read = &mut reader => {
                debug!(user_id = %session.user_id, "Inbound pump finished");
                read
            }
            write = &mut writer => {
                debug!(user_id = %session.user_id, "Outbound pump finished");
                match write {
                    Ok(result) => result,
                    Err(e) => Err(WebSocketError::WriteFailure(format!("Outbound pump panicked: {}", e))),
                }
            }
        };

        if let Err(e) = registry.unregister(session.clone()).await {
            warn!(user_id = %session.user_id, "Failed to unregister session: {}", e);
        }

        // Unregistering closes the queue, which lets a still-running writer send
        // its close frame. Give it one write window to do so.
        if !writer.is_finished() {
            let _ = timeout(config.write_wait, &mut writer).await;
            writer.abort();
        }

        match &result {
            Ok(()) => info!(user_id = %session.user_id, session_id = %session.id, "Session closed"),
            Err(e) => warn!(user_id = %session.user_id, session_id = %session.id, "Session terminated: {}", e),
        }
        result
    }
}

/// Read frames until the peer goes away, forwarding signaling messages to the registry.
///
/// Every frame, keepalive pongs included, restarts the idle window. Malformed
/// messages are logged and skipped; the connection stays up.
pub async fn inbound_pump<S, E>(
    mut stream: S,
    session: SessionRef,
    registry: RegistryHandle,
    pong_wait: Duration,
) -> Result<(), WebSocketError>
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = match timeout(pong_wait, stream.next()).await {
            Ok(frame) => frame,
            Err(_) => return Err(WebSocketError::IdleTimeout(pong_wait)),
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => match Message::parse(&text) {
                Ok(message) => {
                    debug!(
                        user_id = %session.user_id,
                        kind = %message.kind,
                        to = %message.target_user_id,
                        "Received signaling message"
                    );
                    registry.route(message, session.clone()).await?;
                }
                Err(e) => {
                    warn!(user_id = %session.user_id, "Discarding message: {}", e);
                }
            },
            Some(Ok(WsMessage::Binary(bin))) => {
                warn!(user_id = %session.user_id, "Discarding binary frame of {} bytes", bin.len());
            }
            Some(Ok(WsMessage::Close(reason))) => {
                info!(user_id = %session.user_id, "Peer closed connection: {:?}", reason);
                return Ok(());
            }
            Some(Ok(_)) => {
                // Ping/pong are answered by the codec; they only count as liveness here.
            }
            Some(Err(e)) => return Err(WebSocketError::ReadFailure(e.to_string())),
            None => return Ok(()),
        }
    }
}

/// Sole writer of the socket.
///
/// Writes queued frames, batching whatever is already waiting into a single
/// flush, and sends a ping every `ping_interval`. Returns after sending a
/// close frame once the registry closes the queue. Any failed or stalled
/// write ends the pump without retry.
pub async fn outbound_pump<K>(
    mut sink: K,
    mut queue: mpsc::Receiver<Frame>,
    config: SessionConfig,
) -> Result<(), WebSocketError>
where
    K: Sink<WsMessage> + Unpin,
    K::Error: Display,
{
    let mut keepalive = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => {
                    let written = write_with_deadline(config.write_wait, write_batch(&mut sink, frame, &mut queue)).await?;
                    debug!(frames = written, "Flushed outbound batch");
                }
                None => {
                    if let Err(e) = write_with_deadline(config.write_wait, send(&mut sink, WsMessage::Close(None))).await {
                        debug!("Close frame not delivered: {}", e);
                    }
                    return Ok(());
                }
            },
            _ = keepalive.tick() => {
                if let Err(e) = write_with_deadline(config.write_wait, send(&mut sink, WsMessage::Ping(Vec::new()))).await {
                    error!("Failed to send keepalive: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

async fn write_batch<K>(sink: &mut K, first: Frame, queue: &mut mpsc::Receiver<Frame>) -> Result<usize, WebSocketError>
where
    K: Sink<WsMessage> + Unpin,
    K::Error: Display,
{
    // Only what was queued on wake joins the batch; later frames wait for the next one.
    let pending = queue.len();
    sink.feed(WsMessage::Text(first.to_string()))
        .await
        .map_err(|e| WebSocketError::WriteFailure(e.to_string()))?;

    let mut written = 1;
    for _ in 0..pending {
        let Ok(frame) = queue.try_recv() else { break };
        sink.feed(WsMessage::Text(frame.to_string()))
            .await
            .map_err(|e| WebSocketError::WriteFailure(e.to_string()))?;
        written += 1;
    }

    sink.flush()
        .await
        .map_err(|e| WebSocketError::WriteFailure(e.to_string()))?;
    Ok(written)
}

async fn send<K>(sink: &mut K, message: WsMessage) -> Result<(), WebSocketError>
where
    K: Sink<WsMessage> + Unpin,
    K::Error: Display,
{
    sink.send(message)
        .await
        .map_err(|e| WebSocketError::WriteFailure(e.to_string()))
}

async fn write_with_deadline<T>(
    deadline: Duration,
    write: impl std::future::Future<Output = Result<T, WebSocketError>>,
) -> Result<T, WebSocketError> {
    timeout(deadline, write)
        .await
        .map_err(|_| WebSocketError::WriteTimeout(deadline))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::registry::{Registry, RegistryEvent};
    use futures::stream;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    /// Sink that records what was written and how many flushes it took.
    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<WsMessage>>>,
        flushes: Arc<Mutex<usize>>,
        fail: bool,
        stall: bool,
        /// Queue refilled on every text write, standing in for a busy registry.
        inflow: Option<mpsc::Sender<Frame>>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<WsMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn flushes(&self) -> usize {
            *self.flushes.lock().unwrap()
        }
    }

    impl Sink<WsMessage> for RecordingSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            if self.stall {
                Poll::Pending
            } else {
                Poll::Ready(Ok(()))
            }
        }

        fn start_send(self: Pin<&mut Self>, item: WsMessage) -> Result<(), Self::Error> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
            }
            if let (Some(inflow), WsMessage::Text(_)) = (&self.inflow, &item) {
                let _ = inflow.try_send(Frame::from("late"));
            }
            self.sent.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            *self.flushes.lock().unwrap() += 1;
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            send_queue_capacity: 8,
            pong_wait: Duration::from_millis(500),
            ping_interval: Duration::from_secs(3600),
            write_wait: Duration::from_millis(100),
        }
    }

    fn text(raw: &str) -> Result<WsMessage, io::Error> {
        Ok(WsMessage::Text(raw.to_string()))
    }

    #[tokio::test]
    async fn test_outbound_coalesces_queued_frames() {
        let sink = RecordingSink::default();
        let (tx, rx) = mpsc::channel::<Frame>(8);
        for frame in ["one", "two", "three"] {
            tx.try_send(Frame::from(frame)).unwrap();
        }
        drop(tx);

        outbound_pump(sink.clone(), rx, quiet_config()).await.unwrap();

        assert_eq!(
            sink.sent(),
            vec![
                WsMessage::Text("one".into()),
                WsMessage::Text("two".into()),
                WsMessage::Text("three".into()),
                WsMessage::Close(None),
            ]
        );
        // One flush for the batch, one for the close frame.
        assert_eq!(sink.flushes(), 2);
    }

    #[tokio::test]
    async fn test_outbound_batch_is_bounded_by_queue_on_wake() {
        let (tx, mut rx) = mpsc::channel::<Frame>(64);
        let mut sink = RecordingSink {
            inflow: Some(tx.clone()),
            ..Default::default()
        };
        for frame in ["one", "two", "three"] {
            tx.try_send(Frame::from(frame)).unwrap();
        }

        let first = rx.recv().await.unwrap();
        let written = write_batch(&mut sink, first, &mut rx).await.unwrap();

        assert_eq!(written, 3);
        assert_eq!(sink.flushes(), 1);
        // Frames that arrived during the batch stay queued for the next one.
        assert_eq!(rx.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_sends_keepalive_pings() {
        let sink = RecordingSink::default();
        let (_tx, rx) = mpsc::channel::<Frame>(8);
        let config = SessionConfig {
            ping_interval: Duration::from_secs(10),
            ..quiet_config()
        };

        let run = timeout(Duration::from_secs(35), outbound_pump(sink.clone(), rx, config)).await;
        assert!(run.is_err(), "pump keeps running while the queue is open");

        let pings = sink.sent().iter().filter(|m| matches!(m, WsMessage::Ping(_))).count();
        assert_eq!(pings, 3);
    }

    #[tokio::test]
    async fn test_outbound_stops_on_write_error() {
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel::<Frame>(8);
        tx.try_send(Frame::from("hello")).unwrap();

        let result = outbound_pump(sink, rx, quiet_config()).await;
        assert!(matches!(result, Err(WebSocketError::WriteFailure(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_gives_up_on_stalled_peer() {
        let sink = RecordingSink {
            stall: true,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel::<Frame>(8);
        tx.try_send(Frame::from("hello")).unwrap();

        let result = outbound_pump(sink, rx, quiet_config()).await;
        assert!(matches!(result, Err(WebSocketError::WriteTimeout(_))));
    }

    #[tokio::test]
    async fn test_inbound_skips_malformed_and_forwards_valid() {
        let (tx, mut rx) = mpsc::channel(8);
        let registry = RegistryHandle::new(tx);
        let origin = SessionRef::new("a");
        let frames = stream::iter(vec![
            text(r#"{"type":"offer","targetUserId":"b","payload":{"sdp":"v=0"}}"#),
            text("{not json"),
            Ok(WsMessage::Binary(vec![1, 2, 3])),
            Ok(WsMessage::Pong(Vec::new())),
            text(r#"{"type":"answer","targetUserId":"c","payload":null}"#),
        ]);

        inbound_pump(frames, origin.clone(), registry, Duration::from_secs(1))
            .await
            .unwrap();

        let mut routed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                RegistryEvent::Route(message, from) => {
                    assert_eq!(from, origin);
                    routed.push((message.kind, message.target_user_id));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(
            routed,
            vec![("offer".to_string(), "b".to_string()), ("answer".to_string(), "c".to_string())]
        );
    }

    #[tokio::test]
    async fn test_inbound_stops_on_close_frame() {
        let (tx, mut rx) = mpsc::channel(8);
        let frames = stream::iter(vec![
            Ok(WsMessage::Close(None)),
            text(r#"{"type":"offer","targetUserId":"b"}"#),
        ]);

        inbound_pump(frames, SessionRef::new("a"), RegistryHandle::new(tx), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err(), "nothing after the close frame is read");
    }

    #[tokio::test]
    async fn test_inbound_read_error_is_fatal() {
        let (tx, _rx) = mpsc::channel(8);
        let frames = stream::iter(vec![Err::<WsMessage, _>(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset by peer",
        ))]);

        let result = inbound_pump(frames, SessionRef::new("a"), RegistryHandle::new(tx), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(WebSocketError::ReadFailure(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_times_out_silent_peer() {
        let (tx, _rx) = mpsc::channel(8);
        let silent = stream::pending::<Result<WsMessage, io::Error>>();

        let result = inbound_pump(silent, SessionRef::new("a"), RegistryHandle::new(tx), Duration::from_secs(60)).await;
        assert!(matches!(result, Err(WebSocketError::IdleTimeout(d)) if d == Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_idle_peer_alive() {
        let (tx, _rx) = mpsc::channel(8);
        // A pong every 54s for ~4.5 minutes, well past a single 60s window.
        let pongs = stream::unfold(0u32, |n| async move {
            if n == 5 {
                return None;
            }
            tokio::time::sleep(PING_INTERVAL).await;
            Some((Ok::<_, io::Error>(WsMessage::Pong(Vec::new())), n + 1))
        });
        let pongs = Box::pin(pongs);

        let result = inbound_pump(pongs, SessionRef::new("a"), RegistryHandle::new(tx), PONG_WAIT).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_inbound_stops_when_registry_is_gone() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let frames = stream::iter(vec![text(r#"{"type":"offer","targetUserId":"b"}"#)]);

        let result = inbound_pump(frames, SessionRef::new("a"), RegistryHandle::new(tx), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(WebSocketError::RegistryClosed)));
    }

    #[tokio::test]
    async fn test_session_registers_and_unregisters() {
        let registry = Registry::default().spawn(8);
        let sink = RecordingSink::default();
        let (peer, frames) = futures::channel::mpsc::unbounded::<Result<WsMessage, io::Error>>();

        let session = Session::new("10.0.0.7:5000", quiet_config());
        let task = tokio::spawn(session.run(sink.clone(), frames, registry.clone()));

        // Wait until the registration has been processed.
        let mut users = Vec::new();
        for _ in 0..50 {
            users = registry.connected_users().await.unwrap();
            if !users.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(users, vec!["10.0.0.7:5000"]);

        // Peer hangs up.
        drop(peer);
        task.await.unwrap().unwrap();

        assert!(registry.connected_users().await.unwrap().is_empty());
        let sent = sink.sent();
        assert_eq!(
            sent.first(),
            Some(&WsMessage::Text(r#"{"type":"user_list","users":["10.0.0.7:5000"]}"#.into()))
        );
        assert_eq!(sent.last(), Some(&WsMessage::Close(None)));
    }
}
