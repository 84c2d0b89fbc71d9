use std::sync::Arc;

use roulette_model::{ClientId, ClientMessage, SignalingMessage};
use tokio::sync::Mutex;

use crate::matchmaker::{Matchmaker, Notification};
use crate::registry::{Outbox, Registry};
use crate::relay;

#[derive(Default)]
struct SwitchboardState {
    registry: Registry,
    matchmaker: Matchmaker,
}

impl SwitchboardState {
    fn dispatch(&self, notifications: impl IntoIterator<Item = Notification>) {
        for notification in notifications {
            self.registry.deliver(&notification.to, notification.message);
        }
    }
}

/// Shared matching state. Every event takes the lock once, so concurrent
/// clients never observe a half-applied pairing.
#[derive(Clone, Default)]
pub struct Switchboard {
    state: Arc<Mutex<SwitchboardState>>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, id: ClientId, outbox: Outbox) {
        self.state.lock().await.registry.register(id, outbox);
        tracing::info!("Client {id} connected");
    }

    pub async fn handle(&self, id: ClientId, message: ClientMessage) {
        match message {
            ClientMessage::Ready => self.ready(id).await,
            ClientMessage::Next => self.next(id).await,
            ClientMessage::Signal(signal) => self.signal(id, signal).await,
        }
    }

    pub async fn ready(&self, id: ClientId) {
        let mut state = self.state.lock().await;
        if !state.registry.contains(&id) {
            tracing::warn!("Ready from unregistered client {id}, ignoring");
            return;
        }
        let notifications = state.matchmaker.announce_ready(id);
        state.dispatch(notifications);
    }

    pub async fn next(&self, id: ClientId) {
        let mut state = self.state.lock().await;
        let notifications = state.matchmaker.request_next(id);
        state.dispatch(notifications);
    }

    pub async fn signal(&self, id: ClientId, message: SignalingMessage) {
        let state = self.state.lock().await;
        let notification = relay::forward(&state.matchmaker, id, message);
        state.dispatch(notification);
    }

    pub async fn disconnect(&self, id: ClientId) {
        let mut state = self.state.lock().await;
        let notifications = state.matchmaker.on_disconnect(id);
        state.dispatch(notifications);
        if state.registry.deregister(&id) {
            tracing::info!("Client {id} disconnected");
        }
    }

    pub async fn connected_clients(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    pub async fn partner_of(&self, id: &ClientId) -> Option<ClientId> {
        self.state.lock().await.matchmaker.partner_of(id)
    }

    pub async fn waiting(&self) -> Option<ClientId> {
        self.state.lock().await.matchmaker.waiting()
    }
}
