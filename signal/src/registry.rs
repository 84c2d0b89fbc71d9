use std::collections::HashMap;

use roulette_model::{ClientId, ServerMessage};
use tokio::sync::mpsc;

pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Live connections and the channel each one is written through.
#[derive(Default)]
pub struct Registry {
    clients: HashMap<ClientId, Outbox>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ClientId, outbox: Outbox) {
        if self.clients.insert(id, outbox).is_some() {
            tracing::warn!("Client {id} registered twice, replacing its outbox");
        }
    }

    /// Returns whether the id was present. Calling it again is harmless.
    pub fn deregister(&mut self, id: &ClientId) -> bool {
        self.clients.remove(id).is_some()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn deliver(&self, to: &ClientId, message: ServerMessage) {
        match self.clients.get(to) {
            Some(outbox) => {
                if outbox.send(message).is_err() {
                    tracing::warn!("Outbox of client {to} is closed, message dropped");
                }
            }
            None => tracing::warn!("Client {to} is not connected, message dropped"),
        }
    }
}
