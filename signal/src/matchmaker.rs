//! Waiting slot, pairing map and ready set.
//!
//! Every operation is total: unknown ids and stale references are no-ops,
//! because socket closes can race with any client event.

use std::collections::{HashMap, HashSet};

use roulette_model::{ClientId, PartnerFound, ServerMessage};

/// A message the caller must deliver once the mutation is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub to: ClientId,
    pub message: ServerMessage,
}

#[derive(Debug, Default)]
pub struct Matchmaker {
    waiting: Option<ClientId>,
    pairs: HashMap<ClientId, ClientId>,
    ready: HashSet<ClientId>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waiting(&self) -> Option<ClientId> {
        self.waiting
    }

    pub fn partner_of(&self, id: &ClientId) -> Option<ClientId> {
        self.pairs.get(id).copied()
    }

    pub fn is_ready(&self, id: &ClientId) -> bool {
        self.ready.contains(id)
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len() / 2
    }

    /// The client that was already waiting becomes the initiator.
    pub fn announce_ready(&mut self, id: ClientId) -> Vec<Notification> {
        if let Some(partner) = self.partner_of(&id) {
            tracing::warn!("{id} announced ready while paired with {partner}, ignoring");
            return Vec::new();
        }

        self.ready.insert(id);
        tracing::info!("{id} is ready");

        match self.waiting {
            None => {
                self.waiting = Some(id);
                tracing::info!("{id} is waiting for a partner");
                Vec::new()
            }
            Some(waiting) if waiting != id && self.ready.contains(&waiting) => {
                self.waiting = None;
                self.pairs.insert(id, waiting);
                self.pairs.insert(waiting, id);
                tracing::info!("Paired {waiting} (initiator) with {id} (responder)");

                vec![
                    Notification {
                        to: waiting,
                        message: ServerMessage::PartnerFound(PartnerFound {
                            partner_id: id,
                            initiator: true,
                        }),
                    },
                    Notification {
                        to: id,
                        message: ServerMessage::PartnerFound(PartnerFound {
                            partner_id: waiting,
                            initiator: false,
                        }),
                    },
                ]
            }
            Some(waiting) => {
                tracing::debug!("{id} announced ready, waiting slot held by {waiting}, no change");
                Vec::new()
            }
        }
    }

    /// Tears down the pairing of `id`, if any. The caller re-announces later.
    pub fn request_next(&mut self, id: ClientId) -> Vec<Notification> {
        tracing::info!("{id} requested next");
        self.release(id)
    }

    pub fn on_disconnect(&mut self, id: ClientId) -> Vec<Notification> {
        self.release(id)
    }

    fn release(&mut self, id: ClientId) -> Vec<Notification> {
        let mut notifications = Vec::new();

        if let Some(partner) = self.pairs.remove(&id) {
            self.pairs.remove(&partner);
            if self.waiting == Some(partner) {
                self.waiting = None;
            }
            // Partner has to re-announce before it can be matched again.
            self.ready.remove(&partner);
            tracing::info!("Unpaired {id} and {partner}");
            notifications.push(Notification {
                to: partner,
                message: ServerMessage::PartnerDisconnected,
            });
        }

        if self.waiting == Some(id) {
            self.waiting = None;
        }
        self.ready.remove(&id);

        notifications
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (a, b) in &self.pairs {
            assert_eq!(self.pairs.get(b), Some(a), "pairing {a} -> {b} is not symmetric");
            assert_ne!(a, b, "{a} is paired with itself");
        }
        if let Some(waiting) = self.waiting {
            assert!(
                !self.pairs.contains_key(&waiting),
                "waiting client {waiting} is also paired"
            );
            assert!(self.ready.contains(&waiting), "waiting client {waiting} is not ready");
        }
    }

    #[cfg(test)]
    pub(crate) fn force_waiting(&mut self, id: ClientId) {
        self.waiting = Some(id);
    }
}
