use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, instrument, warn};

use stockpulse_core::{BridgeError, Notification};

use crate::handler::ChangeHandler;
use crate::source::{NotificationConnection, NotificationSource};

/// Where the listener is in its connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    /// Connection open, nobody reading from it yet.
    Connected,
    Listening,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
        }
    }
}

/// Why `start_listening` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenOutcome {
    /// The caller's cancellation token fired.
    Cancelled,
    /// The event source closed the connection.
    PeerClosed,
    /// `disconnect()` was called while listening.
    Disconnected,
}

type Handlers = Arc<RwLock<Vec<Arc<dyn ChangeHandler>>>>;

struct ListenRequest {
    channel: String,
    reply: oneshot::Sender<Result<(), BridgeError>>,
}

/// Present while a `start_listening` call owns the connection.
struct ActiveSession {
    stop: CancellationToken,
    requests: mpsc::UnboundedSender<ListenRequest>,
}

/// Owns at most one connection to the event source and delivers every message
/// on its channels to all registered handlers, once each, in arrival order.
pub struct UpstreamListener {
    source: Arc<dyn NotificationSource>,
    // Held across `source.connect()` so two connects can't race.
    connection: tokio::sync::Mutex<Option<Box<dyn NotificationConnection>>>,
    active: Mutex<Option<ActiveSession>>,
    state: RwLock<ListenerState>,
    channels: Mutex<Vec<String>>,
    handlers: Handlers,
}

impl UpstreamListener {
    pub fn new(source: Arc<dyn NotificationSource>) -> Self {
        Self {
            source,
            connection: tokio::sync::Mutex::new(None),
            active: Mutex::new(None),
            state: RwLock::new(ListenerState::Disconnected),
            channels: Mutex::new(Vec::new()),
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    /// Channels this listener subscribes to on every (re)connect.
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().clone()
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.write() = state;
    }

    /// Register a handler for every future message. Safe at any time; a
    /// handler added mid-stream sees events dispatched after the append.
    pub fn add_listener(&self, handler: Arc<dyn ChangeHandler>) {
        debug!(handler = handler.name(), "handler registered");
        self.handlers.write().push(handler);
    }

    /// Open the upstream connection if there is none, subscribing it to every
    /// remembered channel. No-op when already connected or listening.
    #[instrument(skip(self), fields(source = %self.source.describe()))]
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() || self.active.lock().is_some() {
            return Ok(());
        }

        self.set_state(ListenerState::Connecting);
        let mut conn = match self.source.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                self.set_state(ListenerState::Disconnected);
                error!(error = %e, "failed to connect to event source");
                return Err(e);
            }
        };

        for channel in self.channels() {
            if let Err(e) = conn.listen(&channel).await {
                conn.close().await;
                self.set_state(ListenerState::Disconnected);
                error!(channel = %channel, error = %e, "failed to subscribe after connecting");
                return Err(e);
            }
        }

        info!(connection_id = %conn.id(), "connected to event source");
        *slot = Some(conn);
        self.set_state(ListenerState::Connected);
        Ok(())
    }

    /// Subscribe to `channel`, connecting first if needed. The channel is
    /// remembered and re-subscribed after every reconnect.
    #[instrument(skip(self))]
    pub async fn listen_to_channel(&self, channel: &str) -> Result<(), BridgeError> {
        {
            let mut channels = self.channels.lock();
            if !channels.iter().any(|c| c == channel) {
                channels.push(channel.to_string());
            }
        }

        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_mut() {
            conn.listen(channel).await?;
            info!(channel, "listening to channel");
            return Ok(());
        }

        let requests = self.active.lock().as_ref().map(|s| s.requests.clone());
        drop(slot);

        match requests {
            Some(requests) => {
                let (reply, rx) = oneshot::channel();
                let request = ListenRequest {
                    channel: channel.to_string(),
                    reply,
                };
                if requests.send(request).is_err() {
                    debug!(channel, "listener stopping, channel applies on reconnect");
                    return Ok(());
                }
                match rx.await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(channel, "listener stopped, channel applies on reconnect");
                        Ok(())
                    }
                }
            }
            None => {
                self.connect().await?;
                info!(channel, "listening to channel");
                Ok(())
            }
        }
    }

    /// Read from the connection until `cancel` fires, the peer closes the
    /// connection, or `disconnect()` is called. Received messages are queued
    /// to a dispatch routine so the read loop never waits on handlers.
    ///
    /// Connects first when there is no connection; that is the only error
    /// this returns.
    pub async fn start_listening(&self, cancel: &CancellationToken) -> Result<ListenOutcome, BridgeError> {
        let mut slot = self.connection.lock().await;
        if slot.is_none() {
            drop(slot);
            self.connect().await?;
            slot = self.connection.lock().await;
        }
        let Some(mut conn) = slot.take() else {
            return Err(BridgeError::Connection(
                "connection released before listening started".into(),
            ));
        };

        let stop = CancellationToken::new();
        let (requests_tx, mut requests) = mpsc::unbounded_channel();
        *self.active.lock() = Some(ActiveSession {
            stop: stop.clone(),
            requests: requests_tx,
        });
        self.set_state(ListenerState::Listening);
        drop(slot);

        let connection_id = conn.id().clone();
        info!(connection_id = %connection_id, channels = ?self.channels(), "listening for notifications");

        let (queue, queued) = mpsc::unbounded_channel();
        // Aborted with this future, so a supervisor that gives up on a slow
        // drain takes the in-flight handlers down with it.
        let dispatcher =
            AbortOnDropHandle::new(tokio::spawn(dispatch_loop(queued, Arc::clone(&self.handlers))));

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ListenOutcome::Cancelled,
                _ = stop.cancelled() => break ListenOutcome::Disconnected,
                Some(request) = requests.recv() => {
                    let result = conn.listen(&request.channel).await;
                    if result.is_ok() {
                        info!(channel = %request.channel, "listening to channel");
                    }
                    let _ = request.reply.send(result);
                }
                message = conn.recv() => match message {
                    Some(notification) => {
                        debug!(channel = %notification.channel, "notification received");
                        let _ = queue.send(notification);
                    }
                    None => break ListenOutcome::PeerClosed,
                },
            }
        };

        self.active.lock().take();
        conn.close().await;
        self.set_state(ListenerState::Disconnected);

        // Let everything already received reach the handlers before returning,
        // so a later session can't overtake it.
        drop(queue);
        if let Err(e) = dispatcher.await {
            error!(error = %e, "dispatch task failed");
        }

        match outcome {
            ListenOutcome::Cancelled => info!(connection_id = %connection_id, "listening cancelled"),
            ListenOutcome::Disconnected => info!(connection_id = %connection_id, "listening stopped by disconnect"),
            ListenOutcome::PeerClosed => {
                warn!(connection_id = %connection_id, "upstream connection closed by peer")
            }
        }
        Ok(outcome)
    }

    /// Release the connection. Stops a running `start_listening` call, which
    /// then closes its own connection. No-op when already disconnected.
    pub async fn disconnect(&self) {
        let listening = match self.active.lock().as_ref() {
            Some(session) => {
                session.stop.cancel();
                true
            }
            None => false,
        };

        let conn = self.connection.lock().await.take();
        if let Some(mut conn) = conn {
            conn.close().await;
            info!(connection_id = %conn.id(), "disconnected from event source");
        }
        if !listening {
            self.set_state(ListenerState::Disconnected);
        }
    }
}

async fn dispatch_loop(mut queued: mpsc::UnboundedReceiver<Notification>, handlers: Handlers) {
    while let Some(notification) = queued.recv().await {
        dispatch(&notification, &handlers).await;
    }
}

/// Decode one message and run every handler on it. Handlers for the same
/// message run concurrently; each failure or panic is logged and contained.
async fn dispatch(notification: &Notification, handlers: &Handlers) {
    let event = match notification.decode() {
        Ok(event) => event,
        Err(e) => {
            warn!(
                channel = %notification.channel,
                error = %e,
                payload_len = notification.payload.len(),
                "dropping undecodable notification"
            );
            return;
        }
    };

    let snapshot: Vec<Arc<dyn ChangeHandler>> = handlers.read().clone();
    let runs = snapshot
        .iter()
        .map(|handler| AssertUnwindSafe(handler.handle(&event)).catch_unwind());
    let results = futures::future::join_all(runs).await;

    for (handler, result) in snapshot.iter().zip(results) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                channel = %notification.channel,
                handler = handler.name(),
                error = %e,
                "handler failed"
            ),
            Err(_) => error!(
                channel = %notification.channel,
                handler = handler.name(),
                "handler panicked"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};
    use stockpulse_core::ChangeEvent;

    use crate::handler::handler_fn;
    use crate::hub::ChannelHub;

    const CHANNEL: &str = "inventory_channel";

    /// Handler that forwards each event into a channel the test can read.
    fn collector(name: &str) -> (Arc<dyn ChangeHandler>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(name, move |event: ChangeEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Value::Object(event.into_fields()));
                Ok(())
            }
        });
        (Arc::new(handler), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("handler channel closed")
    }

    fn listener(hub: &ChannelHub) -> Arc<UpstreamListener> {
        Arc::new(UpstreamListener::new(Arc::new(hub.clone())))
    }

    fn spawn_listening(
        listener: &Arc<UpstreamListener>,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<Result<ListenOutcome, BridgeError>> {
        let listener = Arc::clone(listener);
        let cancel = cancel.clone();
        tokio::spawn(async move { listener.start_listening(&cancel).await })
    }

    async fn wait_for_state(listener: &UpstreamListener, state: ListenerState) {
        for _ in 0..200 {
            if listener.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("listener never reached {state:?}, stuck at {:?}", listener.state());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);
        assert_eq!(listener.state(), ListenerState::Disconnected);

        listener.connect().await.unwrap();
        listener.connect().await.unwrap();
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(listener.state(), ListenerState::Connected);
    }

    #[tokio::test]
    async fn connect_failure_is_connection_error() {
        let hub = ChannelHub::new();
        hub.set_reachable(false);
        let listener = listener(&hub);

        let err = listener.connect().await.unwrap_err();
        assert_eq!(err.error_kind(), "connection");
        assert_eq!(listener.state(), ListenerState::Disconnected);
    }

    #[tokio::test]
    async fn listen_to_channel_connects_when_needed() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);
        listener.listen_to_channel(CHANNEL).await.unwrap();
        listener.listen_to_channel(CHANNEL).await.unwrap();

        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.listener_count(CHANNEL), 1);
        assert_eq!(listener.channels(), vec![CHANNEL.to_string()]);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);
        listener.disconnect().await;

        listener.connect().await.unwrap();
        listener.disconnect().await;
        listener.disconnect().await;
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(listener.state(), ListenerState::Disconnected);
    }

    #[tokio::test]
    async fn delivers_in_arrival_order_to_all_handlers() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);
        let (first, mut first_rx) = collector("first");
        let (second, mut second_rx) = collector("second");
        listener.add_listener(first);
        listener.add_listener(second);
        listener.listen_to_channel(CHANNEL).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_listening(&listener, &cancel);
        wait_for_state(&listener, ListenerState::Listening).await;

        for i in 0..5 {
            hub.publish(CHANNEL, &json!({"id": i}).to_string());
        }
        for i in 0..5 {
            assert_eq!(next(&mut first_rx).await, json!({"id": i}));
            assert_eq!(next(&mut second_rx).await, json!({"id": i}));
        }

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), ListenOutcome::Cancelled);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(listener.state(), ListenerState::Disconnected);
    }

    #[tokio::test]
    async fn malformed_payload_does_not_block_next() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);
        let (handler, mut rx) = collector("collect");
        listener.add_listener(handler);
        listener.listen_to_channel(CHANNEL).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_listening(&listener, &cancel);
        wait_for_state(&listener, ListenerState::Listening).await;

        hub.publish(CHANNEL, "{not json");
        hub.publish(CHANNEL, "[1,2]");
        hub.publish(CHANNEL, r#"{"id": 1, "name": "Widget", "quantity": 5}"#);

        assert_eq!(
            next(&mut rx).await,
            json!({"id": 1, "name": "Widget", "quantity": 5})
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failing_handler_is_isolated() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);

        listener.add_listener(Arc::new(handler_fn("fails", |event: ChangeEvent| async move {
            if event.get("id") == Some(&json!(1)) {
                return Err(BridgeError::handler("fails", "rejected event 1"));
            }
            Ok(())
        })));
        listener.add_listener(Arc::new(handler_fn("panics", |event: ChangeEvent| async move {
            if event.get("id") == Some(&json!(1)) {
                panic!("handler blew up");
            }
            Ok(())
        })));
        let (handler, mut rx) = collector("collect");
        listener.add_listener(handler);
        listener.listen_to_channel(CHANNEL).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_listening(&listener, &cancel);
        wait_for_state(&listener, ListenerState::Listening).await;

        hub.publish(CHANNEL, r#"{"id":1}"#);
        hub.publish(CHANNEL, r#"{"id":2}"#);
        assert_eq!(next(&mut rx).await, json!({"id": 1}));
        assert_eq!(next(&mut rx).await, json!({"id": 2}));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);
        let (handler, mut rx) = collector("collect");
        listener.add_listener(handler);
        listener.listen_to_channel(CHANNEL).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_listening(&listener, &cancel);
        wait_for_state(&listener, ListenerState::Listening).await;

        hub.publish(CHANNEL, r#"{"seq":1}"#);
        hub.drop_connections();

        assert_eq!(task.await.unwrap().unwrap(), ListenOutcome::PeerClosed);
        assert_eq!(next(&mut rx).await, json!({"seq": 1}));
        assert_eq!(listener.state(), ListenerState::Disconnected);

        // Reconnecting re-subscribes the remembered channel.
        listener.connect().await.unwrap();
        assert_eq!(hub.listener_count(CHANNEL), 1);
    }

    #[tokio::test]
    async fn disconnect_stops_listening() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);
        listener.listen_to_channel(CHANNEL).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_listening(&listener, &cancel);
        wait_for_state(&listener, ListenerState::Listening).await;

        listener.disconnect().await;
        assert_eq!(task.await.unwrap().unwrap(), ListenOutcome::Disconnected);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn channel_added_while_listening() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);
        let (handler, mut rx) = collector("collect");
        listener.add_listener(handler);
        listener.listen_to_channel(CHANNEL).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_listening(&listener, &cancel);
        wait_for_state(&listener, ListenerState::Listening).await;

        listener.listen_to_channel("restock").await.unwrap();
        assert_eq!(hub.listener_count("restock"), 1);

        hub.publish("restock", r#"{"id":9}"#);
        assert_eq!(next(&mut rx).await, json!({"id": 9}));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_added_while_listening_sees_only_later_events() {
        let hub = ChannelHub::new();
        let listener = listener(&hub);
        let (early, mut early_rx) = collector("early");
        listener.add_listener(early);
        listener.listen_to_channel(CHANNEL).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_listening(&listener, &cancel);
        wait_for_state(&listener, ListenerState::Listening).await;

        hub.publish(CHANNEL, &json!({"seq": 1}).to_string());
        assert_eq!(next(&mut early_rx).await, json!({"seq": 1}));

        let (late, mut late_rx) = collector("late");
        listener.add_listener(late);
        hub.publish(CHANNEL, &json!({"seq": 2}).to_string());

        assert_eq!(next(&mut late_rx).await, json!({"seq": 2}));
        assert_eq!(next(&mut early_rx).await, json!({"seq": 2}));
        assert!(late_rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn start_listening_propagates_connect_failure() {
        let hub = ChannelHub::new();
        hub.set_reachable(false);
        let listener = listener(&hub);

        let cancel = CancellationToken::new();
        let err = listener.start_listening(&cancel).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
