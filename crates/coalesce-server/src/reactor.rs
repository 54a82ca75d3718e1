//! The broadcast reactor.
//!
//! One task owns the [`RoomRegistry`] and the outbound queue of every
//! connection. Connection tasks hand it decoded requests through a
//! [`ReactorHandle`]; the reactor batches publications per room and writes
//! flushed windows back to the connection queues.
//!
//! Each loop iteration is one pass:
//!
//! 1. `on_before_wait` - rooms with an open window arm a forced wakeup
//! 2. wait for the next event (bounded by the wakeup, if armed)
//! 3. handle that event and whatever else is already queued
//! 4. `on_after_ready` - windows with a quiet pass are flushed and sent

use crate::metrics;
use bytes::Bytes;
use coalesce_core::{Action, DispatchPlan, IdArena, RegistryConfig, RoomRegistry, SubscriberId};
use coalesce_protocol::{codec, codes, Frame};
use std::ops::ControlFlow;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, trace, warn};

/// Outbound queue of one connection. Carries encoded frames.
pub type Outbound = mpsc::UnboundedSender<Bytes>;

/// Reactor errors seen by connection tasks.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The reactor has stopped.
    #[error("Reactor closed")]
    Closed,

    /// The connection limit was reached.
    #[error("Maximum connections reached")]
    MaxConnectionsReached,
}

/// Reactor configuration.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Capacity of the inbound event queue.
    pub queue_capacity: usize,
    /// Events handled per pass before the window hooks run.
    pub max_events_per_pass: usize,
    /// Maximum number of registered connections.
    pub max_connections: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 65_536,
            max_events_per_pass: 1024,
            max_connections: 100_000,
        }
    }
}

/// Requests handled by the reactor.
#[derive(Debug)]
pub enum ReactorEvent {
    /// Register a connection and its outbound queue.
    Connect {
        outbound: Outbound,
        reply: oneshot::Sender<Result<SubscriberId, ReactorError>>,
    },
    /// Drop a connection and all its subscriptions.
    Disconnect(SubscriberId),
    /// Join a room.
    Subscribe {
        id: SubscriberId,
        request: u64,
        room: String,
    },
    /// Leave a room.
    Unsubscribe {
        id: SubscriberId,
        request: u64,
        room: String,
    },
    /// Publish into a room's current window.
    Publish {
        id: SubscriberId,
        request: Option<u64>,
        room: String,
        payload: Vec<u8>,
    },
    /// Flush every open window and stop.
    Shutdown,
}

/// Cloneable handle used by connection tasks.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    events: mpsc::Sender<ReactorEvent>,
}

impl ReactorHandle {
    async fn send(&self, event: ReactorEvent) -> Result<(), ReactorError> {
        self.events.send(event).await.map_err(|_| ReactorError::Closed)
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the reactor is gone or the connection limit is reached.
    pub async fn connect(&self, outbound: Outbound) -> Result<SubscriberId, ReactorError> {
        let (reply, response) = oneshot::channel();
        self.send(ReactorEvent::Connect { outbound, reply }).await?;
        response.await.map_err(|_| ReactorError::Closed)?
    }

    /// Unregister a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the reactor is gone.
    pub async fn disconnect(&self, id: SubscriberId) -> Result<(), ReactorError> {
        self.send(ReactorEvent::Disconnect(id)).await
    }

    /// Join a room. The reactor answers on the connection's outbound queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the reactor is gone.
    pub async fn subscribe(
        &self,
        id: SubscriberId,
        request: u64,
        room: impl Into<String>,
    ) -> Result<(), ReactorError> {
        self.send(ReactorEvent::Subscribe {
            id,
            request,
            room: room.into(),
        })
        .await
    }

    /// Leave a room. The reactor answers on the connection's outbound queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the reactor is gone.
    pub async fn unsubscribe(
        &self,
        id: SubscriberId,
        request: u64,
        room: impl Into<String>,
    ) -> Result<(), ReactorError> {
        self.send(ReactorEvent::Unsubscribe {
            id,
            request,
            room: room.into(),
        })
        .await
    }

    /// Publish into a room. An ack is queued only when `request` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the reactor is gone.
    pub async fn publish(
        &self,
        id: SubscriberId,
        request: Option<u64>,
        room: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<(), ReactorError> {
        self.send(ReactorEvent::Publish {
            id,
            request,
            room: room.into(),
            payload,
        })
        .await
    }

    /// Ask the reactor to flush and stop.
    ///
    /// # Errors
    ///
    /// Returns an error if the reactor is already gone.
    pub async fn shutdown(&self) -> Result<(), ReactorError> {
        self.send(ReactorEvent::Shutdown).await
    }
}

/// Outcome of waiting for the next event.
enum Wait {
    Event(ReactorEvent),
    Wakeup,
    Closed,
}

/// The reactor task state.
pub struct Reactor {
    registry: RoomRegistry,
    connections: IdArena<Outbound>,
    events: mpsc::Receiver<ReactorEvent>,
    config: ReactorConfig,
}

impl Reactor {
    /// Create a reactor and the handle that feeds it.
    #[must_use]
    pub fn new(registry: RegistryConfig, config: ReactorConfig) -> (Self, ReactorHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let reactor = Self {
            registry: RoomRegistry::with_config(registry),
            connections: IdArena::new(),
            events: rx,
            config,
        };
        (reactor, ReactorHandle { events: tx })
    }

    /// Run until shut down or every handle is dropped.
    pub async fn run(mut self) {
        info!("Reactor started");

        loop {
            let wakeup = self.registry.on_before_wait();

            let waited = match wakeup {
                Some(after) => match time::timeout(after, self.events.recv()).await {
                    Ok(Some(event)) => Wait::Event(event),
                    Ok(None) => Wait::Closed,
                    Err(_) => Wait::Wakeup,
                },
                None => match self.events.recv().await {
                    Some(event) => Wait::Event(event),
                    None => Wait::Closed,
                },
            };

            let flow = match waited {
                Wait::Event(event) => self.handle_ready(event),
                Wait::Wakeup => ControlFlow::Continue(()),
                Wait::Closed => ControlFlow::Break(()),
            };

            for plan in self.registry.on_after_ready() {
                self.dispatch(plan);
            }

            if flow.is_break() {
                break;
            }
        }

        for plan in self.registry.flush_all() {
            self.dispatch(plan);
        }

        info!("Reactor stopped");
    }

    /// Handle `first` and any events already queued behind it.
    fn handle_ready(&mut self, first: ReactorEvent) -> ControlFlow<()> {
        self.handle(first)?;

        for _ in 1..self.config.max_events_per_pass {
            match self.events.try_recv() {
                Ok(event) => self.handle(event)?,
                Err(_) => break,
            }
        }

        ControlFlow::Continue(())
    }

    fn handle(&mut self, event: ReactorEvent) -> ControlFlow<()> {
        match event {
            ReactorEvent::Connect { outbound, reply } => {
                let result = if self.connections.len() >= self.config.max_connections {
                    warn!("Connection rejected: limit reached");
                    Err(ReactorError::MaxConnectionsReached)
                } else {
                    let id = self.connections.insert(outbound);
                    debug!(connection = %id, "Connection registered");
                    Ok(id)
                };

                if let Err(Ok(id)) = reply.send(result) {
                    // The connection task went away before hearing back
                    self.connections.remove(id);
                }
            }

            ReactorEvent::Disconnect(id) => {
                self.registry.unsubscribe_all(id);
                self.connections.remove(id);
                metrics::set_active_rooms(self.registry.stats().room_count);
                debug!(connection = %id, "Connection unregistered");
            }

            ReactorEvent::Subscribe { id, request, room } => {
                let response = match self.registry.subscribe(id, &room) {
                    Ok(added) => {
                        if added {
                            metrics::record_subscription();
                            metrics::set_active_rooms(self.registry.stats().room_count);
                        }
                        Frame::ack(request)
                    }
                    Err(e) => {
                        warn!(connection = %id, room = %room, error = %e, "Subscribe failed");
                        Frame::error(request, codes::SUBSCRIBE_FAILED, e.to_string())
                    }
                };
                self.reply(id, &response);
            }

            ReactorEvent::Unsubscribe { id, request, room } => {
                let response = if self.registry.unsubscribe(id, &room) {
                    metrics::set_active_rooms(self.registry.stats().room_count);
                    Frame::ack(request)
                } else {
                    Frame::error(
                        request,
                        codes::UNSUBSCRIBE_FAILED,
                        format!("Not subscribed to room: {room}"),
                    )
                };
                self.reply(id, &response);
            }

            ReactorEvent::Publish {
                id,
                request,
                room,
                payload,
            } => match self.registry.publish(id, &room, &payload) {
                Ok(()) => {
                    trace!(connection = %id, room = %room, bytes = payload.len(), "Published");
                    if let Some(request) = request {
                        self.reply(id, &Frame::ack(request));
                    }
                }
                Err(e) => {
                    debug!(connection = %id, room = %room, error = %e, "Publish rejected");
                    metrics::record_error("publish");
                    self.reply(
                        id,
                        &Frame::error(request.unwrap_or(0), codes::PUBLISH_FAILED, e.to_string()),
                    );
                }
            },

            ReactorEvent::Shutdown => {
                info!("Reactor shutting down");
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }

    /// Queue the sends of one flushed window.
    ///
    /// The verbatim frame is encoded once and the same buffer is queued for
    /// every pure listener.
    fn dispatch(&self, plan: DispatchPlan) {
        let stats = plan.stats();
        metrics::record_flush(&stats);

        let verbatim_frame = if stats.verbatim > 0 {
            self.encode_batch(plan.room(), plan.verbatim())
        } else {
            None
        };

        for (id, action) in plan.entries() {
            let frame = match action {
                Action::SendVerbatim(_) => verbatim_frame.clone(),
                Action::SendBytes(payload) => self.encode_batch(plan.room(), payload),
            };
            if let Some(frame) = frame {
                self.queue(*id, frame);
            }
        }

        trace!(
            room = %plan.room(),
            publications = stats.publications,
            verbatim = stats.verbatim,
            reconstructed = stats.reconstructed,
            "Window dispatched"
        );
    }

    fn encode_batch(&self, room: &str, payload: &[u8]) -> Option<Bytes> {
        match codec::encode_batch(room, payload) {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!(room = %room, error = %e, "Failed to encode batch");
                metrics::record_error("encode");
                None
            }
        }
    }

    fn reply(&self, id: SubscriberId, frame: &Frame) {
        match codec::encode(frame) {
            Ok(data) => self.queue(id, data),
            Err(e) => error!(connection = %id, error = %e, "Failed to encode reply"),
        }
    }

    /// Hand a frame to a connection. A closed queue only affects that peer.
    fn queue(&self, id: SubscriberId, frame: Bytes) {
        match self.connections.get(id) {
            Some(outbound) => {
                if outbound.send(frame).is_err() {
                    debug!(connection = %id, "Outbound queue closed");
                }
            }
            None => trace!(connection = %id, "Dropped frame for unknown connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Frame {
        let data = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound queue closed");
        codec::decode(&data).unwrap()
    }

    async fn connect(handle: &ReactorHandle) -> (SubscriberId, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = handle.connect(tx).await.unwrap();
        (id, rx)
    }

    fn start() -> (ReactorHandle, tokio::task::JoinHandle<()>) {
        let (reactor, handle) = Reactor::new(RegistryConfig::default(), ReactorConfig::default());
        (handle, tokio::spawn(reactor.run()))
    }

    #[tokio::test]
    async fn test_hello_world_fanout() {
        let (handle, task) = start();
        let (a, mut rx_a) = connect(&handle).await;
        let (b, mut rx_b) = connect(&handle).await;
        let (c, mut rx_c) = connect(&handle).await;

        for (id, rx) in [(a, &mut rx_a), (b, &mut rx_b), (c, &mut rx_c)] {
            handle.subscribe(id, 1, "room").await.unwrap();
            assert_eq!(next_frame(rx).await, Frame::ack(1));
        }

        handle.publish(a, None, "room", b"hello".to_vec()).await.unwrap();
        handle.publish(b, None, "room", b"world".to_vec()).await.unwrap();

        assert_eq!(next_frame(&mut rx_a).await, Frame::batch("room", b"world".to_vec()));
        assert_eq!(next_frame(&mut rx_b).await, Frame::batch("room", b"hello".to_vec()));
        assert_eq!(
            next_frame(&mut rx_c).await,
            Frame::batch("room", b"helloworld".to_vec())
        );

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_flush_independently() {
        let (handle, task) = start();
        let (a, mut rx_a) = connect(&handle).await;
        let (listener, mut rx_l) = connect(&handle).await;

        handle.subscribe(a, 1, "room").await.unwrap();
        handle.subscribe(listener, 2, "room").await.unwrap();
        assert_eq!(next_frame(&mut rx_a).await, Frame::ack(1));
        assert_eq!(next_frame(&mut rx_l).await, Frame::ack(2));

        handle.publish(a, None, "room", b"x".to_vec()).await.unwrap();
        assert_eq!(next_frame(&mut rx_l).await, Frame::batch("room", b"x".to_vec()));

        handle.publish(a, None, "room", b"y".to_vec()).await.unwrap();
        assert_eq!(next_frame(&mut rx_l).await, Frame::batch("room", b"y".to_vec()));

        // The sole publisher never hears itself
        assert!(rx_a.try_recv().is_err());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_errors_are_reported() {
        let (handle, task) = start();
        let (a, mut rx_a) = connect(&handle).await;

        handle.subscribe(a, 1, "$reserved").await.unwrap();
        match next_frame(&mut rx_a).await {
            Frame::Error { id, code, .. } => {
                assert_eq!(id, 1);
                assert_eq!(code, codes::SUBSCRIBE_FAILED);
            }
            other => panic!("Expected Error, got {:?}", other),
        }

        handle.unsubscribe(a, 2, "room").await.unwrap();
        match next_frame(&mut rx_a).await {
            Frame::Error { code, .. } => assert_eq!(code, codes::UNSUBSCRIBE_FAILED),
            other => panic!("Expected Error, got {:?}", other),
        }

        handle.publish(a, Some(3), "missing", b"x".to_vec()).await.unwrap();
        match next_frame(&mut rx_a).await {
            Frame::Error { id, code, .. } => {
                assert_eq!(id, 3);
                assert_eq!(code, codes::PUBLISH_FAILED);
            }
            other => panic!("Expected Error, got {:?}", other),
        }

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_subscribe_is_acked_once_joined() {
        let (handle, task) = start();
        let (a, mut rx_a) = connect(&handle).await;
        let (listener, mut rx_l) = connect(&handle).await;

        handle.subscribe(listener, 1, "room").await.unwrap();
        handle.subscribe(listener, 2, "room").await.unwrap();
        assert_eq!(next_frame(&mut rx_l).await, Frame::ack(1));
        assert_eq!(next_frame(&mut rx_l).await, Frame::ack(2));

        handle.publish(a, None, "room", b"once".to_vec()).await.unwrap();
        assert_eq!(next_frame(&mut rx_l).await, Frame::batch("room", b"once".to_vec()));

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        // One membership, one delivery
        assert!(rx_l.try_recv().is_err());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_stops_delivery() {
        let (handle, task) = start();
        let (a, mut rx_a) = connect(&handle).await;
        let (b, mut rx_b) = connect(&handle).await;

        handle.subscribe(a, 1, "room").await.unwrap();
        handle.subscribe(b, 1, "room").await.unwrap();
        assert_eq!(next_frame(&mut rx_a).await, Frame::ack(1));
        assert_eq!(next_frame(&mut rx_b).await, Frame::ack(1));

        handle.disconnect(b).await.unwrap();
        handle.publish(a, Some(2), "room", b"after".to_vec()).await.unwrap();
        assert_eq!(next_frame(&mut rx_a).await, Frame::ack(2));

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        // Reactor dropped every outbound queue without sending b a batch
        assert!(rx_b.recv().await.is_none());
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (reactor, handle) = Reactor::new(
            RegistryConfig::default(),
            ReactorConfig {
                max_connections: 1,
                ..ReactorConfig::default()
            },
        );
        let task = tokio::spawn(reactor.run());

        let (_a, _rx_a) = connect(&handle).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            handle.connect(tx).await,
            Err(ReactorError::MaxConnectionsReached)
        ));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_windows() {
        let (handle, task) = start();
        let (a, _rx_a) = connect(&handle).await;
        let (listener, mut rx_l) = connect(&handle).await;
        handle.subscribe(listener, 1, "room").await.unwrap();
        assert_eq!(next_frame(&mut rx_l).await, Frame::ack(1));

        // Publish and shutdown land in the same pass
        handle.publish(a, None, "room", b"last".to_vec()).await.unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(next_frame(&mut rx_l).await, Frame::batch("room", b"last".to_vec()));
    }
}
