use roulette_model::{ClientId, ServerMessage, SignalingMessage};

use crate::matchmaker::{Matchmaker, Notification};

/// Routes a signaling message to the sender's current partner.
///
/// Without a partner the message is dropped. That happens routinely when a
/// candidate is gathered just as the partner leaves.
pub fn forward(
    matchmaker: &Matchmaker,
    from: ClientId,
    message: SignalingMessage,
) -> Option<Notification> {
    match matchmaker.partner_of(&from) {
        Some(partner) => {
            tracing::debug!("Signal {} from {from} to {partner}", message.kind());
            Some(Notification {
                to: partner,
                message: ServerMessage::Signal(message),
            })
        }
        None => {
            tracing::warn!("Signal {} from {from} but no partner found", message.kind());
            None
        }
    }
}
