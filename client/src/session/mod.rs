//! Client-side pairing lifecycle.
//!
//! A `Session` owns every piece of per-pairing state and is driven by a
//! single mailbox of [`SessionEvent`]s. Relay messages, peer stack
//! callbacks, timer expiries and user commands all arrive there and are
//! applied one at a time.

mod events;
mod ice_queue;
mod state;
mod status;
mod timers;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use roulette_model::{ClientId, ClientMessage, PartnerFound, Role, ServerMessage, SignalingMessage};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::transport::{
    ConnectionState, IceState, PeerTransport, TransportErrors, TransportEvent, TransportEventSink,
    TransportFactory,
};

pub use events::SessionEvent;
pub use ice_queue::IceCandidateQueue;
pub use state::SessionState;
pub use status::SessionStatus;
pub use timers::{TimerHandle, TimerKind};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    /// How long ICE may sit in `checking` before a restart is requested.
    pub ice_checking_timeout: Duration,
    pub retry_delay: Duration,
    /// Automatic restarts granted to one pairing after a failure.
    pub max_retries: u32,
    pub reannounce_delay: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ice_checking_timeout: Duration::from_secs(15),
            retry_delay: Duration::from_secs(2),
            max_retries: 1,
            reannounce_delay: Duration::from_millis(500),
        }
    }
}

/// Cloneable way to poke a running session from the outside.
#[derive(Clone)]
pub struct SessionHandle {
    mailbox: mpsc::UnboundedSender<SessionEvent>,
    pairing_token: watch::Receiver<CancellationToken>,
}

impl SessionHandle {
    /// Abandons whatever the current pairing is doing and asks for a new partner.
    pub fn request_next(&self) {
        self.pairing_token.borrow().cancel();
        self.send(SessionEvent::RequestNext);
    }

    pub fn shutdown(&self) {
        self.pairing_token.borrow().cancel();
        self.send(SessionEvent::Shutdown);
    }

    pub fn mailbox(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.mailbox.clone()
    }

    pub fn send(&self, event: SessionEvent) {
        if self.mailbox.send(event).is_err() {
            tracing::warn!("Session is not running, event dropped");
        }
    }
}

struct Pairing<T> {
    partner: ClientId,
    role: Role,
    epoch: u64,
    token: CancellationToken,
    transport: Option<Arc<T>>,
    remote_description_set: bool,
    offer_pending: bool,
    candidates: IceCandidateQueue,
    ice_timer: Option<TimerHandle>,
    retry_timer: Option<TimerHandle>,
    retries: u32,
    ice_restarts: u32,
}

impl<T> Pairing<T> {
    fn new(found: &PartnerFound, epoch: u64) -> Self {
        Self {
            partner: found.partner_id,
            role: found.role(),
            epoch,
            token: CancellationToken::new(),
            transport: None,
            remote_description_set: false,
            offer_pending: false,
            candidates: IceCandidateQueue::new(),
            ice_timer: None,
            retry_timer: None,
            retries: 0,
            ice_restarts: 0,
        }
    }
}

pub struct Session<F: TransportFactory> {
    factory: F,
    policy: SessionPolicy,
    mailbox: mpsc::UnboundedSender<SessionEvent>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    status: mpsc::UnboundedSender<SessionStatus>,
    pairing_token: watch::Sender<CancellationToken>,

    state: SessionState,
    media_ready: bool,
    server_connected: bool,
    epoch: u64,
    pairing: Option<Pairing<F::Transport>>,
    reannounce: Option<TimerHandle>,
}

/// Runs one negotiation step unless the pairing gets cancelled first.
async fn guarded<T>(
    token: &CancellationToken,
    step: impl Future<Output = Result<T, TransportErrors>>,
) -> Result<T, TransportErrors> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TransportErrors::Cancelled),
        result = step => result,
    }
}

impl<F: TransportFactory> Session<F> {
    pub fn new(
        factory: F,
        policy: SessionPolicy,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        status: mpsc::UnboundedSender<SessionStatus>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (token_tx, token_rx) = watch::channel(CancellationToken::new());

        let session = Self {
            factory,
            policy,
            mailbox: mailbox_tx.clone(),
            outbound,
            status,
            pairing_token: token_tx,
            state: SessionState::Idle,
            media_ready: false,
            server_connected: false,
            epoch: 0,
            pairing: None,
            reannounce: None,
        };
        let handle = SessionHandle {
            mailbox: mailbox_tx,
            pairing_token: token_rx,
        };
        (session, handle, mailbox_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Counter bumped for every new pairing; stale events carry an older value.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn partner(&self) -> Option<ClientId> {
        self.pairing.as_ref().map(|pairing| pairing.partner)
    }

    pub fn queued_candidates(&self) -> usize {
        self.pairing
            .as_ref()
            .map_or(0, |pairing| pairing.candidates.len())
    }

    pub fn ice_restarts(&self) -> u32 {
        self.pairing.as_ref().map_or(0, |pairing| pairing.ice_restarts)
    }

    pub fn retries(&self) -> u32 {
        self.pairing.as_ref().map_or(0, |pairing| pairing.retries)
    }

    // Main loop (blocking)
    pub async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = mailbox.recv().await {
            let shutdown = matches!(event, SessionEvent::Shutdown);
            self.handle(event).await;
            if shutdown {
                break;
            }
        }
        tracing::info!("Session stopped");
    }

    pub async fn handle(&mut self, event: SessionEvent) {
        tracing::debug!("Session event {event} in state {}", self.state);
        match event {
            SessionEvent::MediaReady => {
                self.media_ready = true;
                self.announce();
            }
            SessionEvent::MediaDenied(reason) => {
                tracing::error!("Local media unavailable: {reason}");
                self.media_ready = false;
                self.emit(SessionStatus::MediaDenied(reason));
            }
            SessionEvent::ServerConnected => {
                tracing::info!("Signaling server connected");
                self.server_connected = true;
                self.announce();
            }
            SessionEvent::ServerDisconnected => self.on_server_lost().await,
            SessionEvent::Relay(ServerMessage::PartnerFound(found)) => {
                self.on_partner_found(found).await
            }
            SessionEvent::Relay(ServerMessage::Signal(message)) => self.on_signal(message).await,
            SessionEvent::Relay(ServerMessage::PartnerDisconnected) => {
                self.on_partner_disconnected().await
            }
            SessionEvent::Transport { epoch, event } => {
                if self.current_epoch() != Some(epoch) {
                    tracing::debug!("Ignoring {event} from stale pairing #{epoch}");
                    return;
                }
                self.on_transport_event(event).await;
            }
            SessionEvent::TimerFired { epoch, kind } => self.on_timer(epoch, kind).await,
            SessionEvent::RequestNext => self.on_request_next().await,
            SessionEvent::Shutdown => {
                self.reannounce = None;
                self.teardown().await;
            }
        }
    }

    fn current_epoch(&self) -> Option<u64> {
        self.pairing.as_ref().map(|pairing| pairing.epoch)
    }

    fn emit(&self, status: SessionStatus) {
        let _ = self.status.send(status);
    }

    fn send(&self, message: ClientMessage) {
        if self.outbound.send(message).is_err() {
            tracing::warn!("Signaling connection is gone, message dropped");
        }
    }

    fn announce(&mut self) {
        if self.state.is_paired() {
            tracing::warn!("Already paired, ready announcement rejected");
            return;
        }
        if self.state == SessionState::AwaitingPartner {
            tracing::debug!("Readiness already announced");
            return;
        }
        if !self.media_ready || !self.server_connected {
            tracing::debug!(
                "Not announcing yet (media ready: {}, server connected: {})",
                self.media_ready,
                self.server_connected
            );
            return;
        }

        self.reannounce = None;
        self.send(ClientMessage::Ready);
        self.state = SessionState::AwaitingPartner;
        self.emit(SessionStatus::Searching);
        tracing::info!("Ready, waiting for a partner");
    }

    fn schedule_reannounce(&mut self) {
        self.reannounce = Some(TimerHandle::start(
            TimerKind::Reannounce,
            self.epoch,
            self.policy.reannounce_delay,
            self.mailbox.clone(),
        ));
    }

    async fn on_partner_found(&mut self, found: PartnerFound) {
        if let Some(pairing) = &self.pairing {
            if pairing.partner == found.partner_id {
                tracing::debug!("Duplicate partner-found for {}, ignored", found.partner_id);
            } else {
                tracing::warn!(
                    "Partner-found for {} while paired with {}, ignored",
                    found.partner_id,
                    pairing.partner
                );
            }
            return;
        }
        if self.state != SessionState::AwaitingPartner {
            // The server already dropped this pairing when it saw our next
            tracing::warn!(
                "Partner-found for {} while {}, ignored",
                found.partner_id,
                self.state
            );
            return;
        }

        self.epoch += 1;
        self.reannounce = None;
        let pairing = Pairing::new(&found, self.epoch);
        self.pairing_token.send_replace(pairing.token.clone());
        tracing::info!(
            "Paired with {} as {} (pairing #{})",
            pairing.partner,
            pairing.role,
            pairing.epoch
        );
        self.emit(SessionStatus::PartnerFound {
            partner: pairing.partner,
            role: pairing.role,
        });
        let role = pairing.role;
        self.pairing = Some(pairing);
        self.state = SessionState::Connecting;

        if role.is_initiator() && self.ensure_transport().await.is_some() {
            self.send_offer(false).await;
        }
    }

    /// Returns the pairing's transport, creating it on first use.
    async fn ensure_transport(&mut self) -> Option<Arc<F::Transport>> {
        let (epoch, token) = {
            let pairing = self.pairing.as_ref()?;
            if let Some(transport) = &pairing.transport {
                return Some(Arc::clone(transport));
            }
            (pairing.epoch, pairing.token.clone())
        };

        let sink = TransportEventSink::new(epoch, self.mailbox.clone());
        match guarded(&token, self.factory.create(sink)).await {
            Ok(transport) => {
                let transport = Arc::new(transport);
                let pairing = self.pairing.as_mut()?;
                pairing.transport = Some(Arc::clone(&transport));
                Some(transport)
            }
            Err(TransportErrors::Cancelled) => {
                tracing::debug!("Transport creation for pairing #{epoch} cancelled");
                None
            }
            Err(err) => {
                tracing::error!("Could not create peer connection: {err}");
                self.on_failure();
                None
            }
        }
    }

    fn negotiation_handles(
        &self,
    ) -> Result<(Arc<F::Transport>, CancellationToken), TransportErrors> {
        self.pairing
            .as_ref()
            .and_then(|pairing| {
                let transport = pairing.transport.as_ref()?;
                Some((Arc::clone(transport), pairing.token.clone()))
            })
            .ok_or(TransportErrors::NoConnection)
    }

    /// Creates and sends an offer. Any error other than cancellation fails
    /// the pairing so the retry policy can take over.
    async fn send_offer(&mut self, ice_restart: bool) {
        let (transport, token) = match self.negotiation_handles() {
            Ok(handles) => handles,
            Err(err) => {
                tracing::error!("Could not create offer: {err}");
                self.on_failure();
                return;
            }
        };

        let offer = guarded(&token, async {
            let offer = transport.create_offer(ice_restart).await?;
            transport.set_local_description(offer.clone()).await?;
            Ok::<_, TransportErrors>(offer)
        })
        .await;

        match offer {
            Ok(offer) => {
                if let Some(pairing) = self.pairing.as_mut() {
                    pairing.offer_pending = true;
                }
                tracing::info!("Sending offer (ice restart: {ice_restart})");
                self.send(ClientMessage::Signal(SignalingMessage::Offer { offer }));
            }
            Err(TransportErrors::Cancelled) => tracing::debug!("Offer abandoned"),
            Err(err) => {
                tracing::error!("Could not create offer: {err}");
                self.on_failure();
            }
        }
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        let Some(pairing) = &self.pairing else {
            tracing::warn!("Received {} without a partner, dropped", message.kind());
            return;
        };
        tracing::debug!("Received {} from {}", message.kind(), pairing.partner);

        match message {
            SignalingMessage::Offer { offer } => self.on_offer(offer).await,
            SignalingMessage::Answer { answer } => self.on_answer(answer).await,
            SignalingMessage::Candidate { candidate } => self.on_candidate(candidate).await,
        }
    }

    async fn on_offer(&mut self, offer: Value) {
        if self.pairing.as_ref().is_some_and(|pairing| pairing.offer_pending) {
            tracing::warn!("Offer received while our own offer is pending, dropped");
            return;
        }
        let Some(transport) = self.ensure_transport().await else {
            return;
        };
        let Some(token) = self.pairing.as_ref().map(|pairing| pairing.token.clone()) else {
            return;
        };

        if let Err(err) = guarded(&token, transport.set_remote_description(offer)).await {
            Self::log_step_error("set remote offer", err);
            return;
        }
        self.remote_description_applied(&transport, &token).await;

        let answer = guarded(&token, async {
            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            Ok::<_, TransportErrors>(answer)
        })
        .await;

        match answer {
            Ok(answer) => {
                tracing::info!("Sending answer");
                self.send(ClientMessage::Signal(SignalingMessage::Answer { answer }));
            }
            Err(err) => Self::log_step_error("create answer", err),
        }
    }

    async fn on_answer(&mut self, answer: Value) {
        if !self.pairing.as_ref().is_some_and(|pairing| pairing.offer_pending) {
            tracing::warn!("Answer received without a pending offer, dropped");
            return;
        }
        let (transport, token) = match self.negotiation_handles() {
            Ok(handles) => handles,
            Err(err) => {
                Self::log_step_error("set remote answer", err);
                return;
            }
        };

        if let Err(err) = guarded(&token, transport.set_remote_description(answer)).await {
            Self::log_step_error("set remote answer", err);
            return;
        }
        if let Some(pairing) = self.pairing.as_mut() {
            pairing.offer_pending = false;
        }
        self.remote_description_applied(&transport, &token).await;
    }

    async fn on_candidate(&mut self, candidate: Value) {
        let Some(pairing) = self.pairing.as_mut() else {
            return;
        };
        let transport = match &pairing.transport {
            Some(transport) if pairing.remote_description_set => Arc::clone(transport),
            _ => {
                pairing.candidates.push(candidate);
                tracing::debug!(
                    "Queued remote candidate ({} pending)",
                    pairing.candidates.len()
                );
                return;
            }
        };
        let token = pairing.token.clone();

        if let Err(err) = guarded(&token, transport.add_ice_candidate(candidate)).await {
            Self::log_step_error("add remote candidate", err);
        }
    }

    /// Marks the remote description as set and applies queued candidates in arrival order.
    async fn remote_description_applied(
        &mut self,
        transport: &Arc<F::Transport>,
        token: &CancellationToken,
    ) {
        let queued = match self.pairing.as_mut() {
            Some(pairing) => {
                pairing.remote_description_set = true;
                pairing.candidates.drain()
            }
            None => return,
        };
        if queued.is_empty() {
            return;
        }

        tracing::debug!("Applying {} queued candidate(s)", queued.len());
        for candidate in queued {
            if let Err(err) = guarded(token, transport.add_ice_candidate(candidate)).await {
                Self::log_step_error("add queued candidate", err);
            }
        }
    }

    fn log_step_error(step: &str, err: TransportErrors) {
        match err {
            TransportErrors::Cancelled => tracing::debug!("Could not {step}: pairing cancelled"),
            err => tracing::error!("Could not {step}: {err}"),
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send(ClientMessage::Signal(SignalingMessage::Candidate { candidate }));
            }
            TransportEvent::GatheringComplete => tracing::debug!("Local candidate gathering done"),
            TransportEvent::RemoteTrack { kind } => {
                tracing::info!("Remote {kind} track arrived");
                self.emit(SessionStatus::RemoteMedia { kind });
            }
            TransportEvent::IceState(IceState::Checking) => self.on_checking(),
            TransportEvent::IceState(IceState::Connected | IceState::Completed)
            | TransportEvent::ConnectionState(ConnectionState::Connected) => self.on_connected(),
            TransportEvent::IceState(IceState::Failed)
            | TransportEvent::ConnectionState(ConnectionState::Failed) => self.on_failure(),
            TransportEvent::IceState(IceState::Disconnected)
            | TransportEvent::ConnectionState(ConnectionState::Disconnected) => {
                self.on_local_disconnect().await
            }
            other => tracing::debug!("Transport reported {other}"),
        }
    }

    fn on_checking(&mut self) {
        let Some(pairing) = self.pairing.as_mut() else {
            return;
        };
        if pairing.ice_timer.is_some() {
            return;
        }
        pairing.ice_timer = Some(TimerHandle::start(
            TimerKind::IceChecking,
            pairing.epoch,
            self.policy.ice_checking_timeout,
            self.mailbox.clone(),
        ));
        self.emit(SessionStatus::Checking);
    }

    fn on_connected(&mut self) {
        let Some(pairing) = self.pairing.as_mut() else {
            return;
        };
        pairing.ice_timer = None;
        pairing.retry_timer = None;
        if self.state != SessionState::Connected {
            tracing::info!("Connected to {}", pairing.partner);
            self.state = SessionState::Connected;
            self.emit(SessionStatus::Connected);
        }
    }

    fn on_failure(&mut self) {
        if self.state == SessionState::Failed {
            tracing::debug!("Already failed");
            return;
        }
        let Some(pairing) = self.pairing.as_mut() else {
            return;
        };
        pairing.ice_timer = None;
        self.state = SessionState::Failed;

        if pairing.retries < self.policy.max_retries {
            pairing.retries += 1;
            tracing::warn!(
                "Connection failed, retry {}/{} in {:?}",
                pairing.retries,
                self.policy.max_retries,
                self.policy.retry_delay
            );
            pairing.retry_timer = Some(TimerHandle::start(
                TimerKind::FailureRetry,
                pairing.epoch,
                self.policy.retry_delay,
                self.mailbox.clone(),
            ));
            let attempt = pairing.retries;
            self.emit(SessionStatus::Retrying { attempt });
        } else {
            tracing::error!(
                "Connection failed after {} retr(ies), waiting for the user",
                pairing.retries
            );
            self.emit(SessionStatus::Failed);
        }
    }

    async fn on_timer(&mut self, epoch: u64, kind: TimerKind) {
        if kind == TimerKind::Reannounce {
            if epoch == self.epoch && self.reannounce.take().is_some() {
                self.announce();
            }
            return;
        }

        let Some(pairing) = self.pairing.as_mut().filter(|pairing| pairing.epoch == epoch) else {
            tracing::debug!("Timer {kind:?} for stale pairing #{epoch} ignored");
            return;
        };

        match kind {
            TimerKind::IceChecking => {
                if pairing.ice_timer.take().is_none()
                    || !matches!(self.state, SessionState::Connecting | SessionState::Connected)
                {
                    return;
                }
                pairing.ice_restarts += 1;
                tracing::warn!("ICE still checking after {:?}", self.policy.ice_checking_timeout);
                self.emit(SessionStatus::IceRestart);
                self.restart_negotiation().await;
            }
            TimerKind::FailureRetry => {
                if pairing.retry_timer.take().is_none() || self.state != SessionState::Failed {
                    return;
                }
                self.restart_negotiation().await;
            }
            TimerKind::Reannounce => {}
        }
    }

    /// Renegotiates within the current pairing. Only the initiator offers,
    /// the responder answers whatever restart offer arrives.
    async fn restart_negotiation(&mut self) {
        self.state = SessionState::Connecting;
        let Some(pairing) = self.pairing.as_mut() else {
            return;
        };
        if !pairing.role.is_initiator() {
            tracing::info!("Waiting for the initiator to restart negotiation");
            return;
        }
        pairing.offer_pending = false;
        // A retry after a failed creation has no transport yet
        if self.ensure_transport().await.is_some() {
            self.send_offer(true).await;
        }
    }

    async fn on_partner_disconnected(&mut self) {
        let Some(pairing) = &self.pairing else {
            tracing::debug!("Partner-disconnected without a pairing, ignored");
            return;
        };
        tracing::info!("Partner {} left", pairing.partner);
        self.teardown().await;
        self.emit(SessionStatus::PartnerLeft);
        self.schedule_reannounce();
    }

    async fn on_local_disconnect(&mut self) {
        tracing::warn!("Peer connection dropped, releasing the pairing");
        self.send(ClientMessage::Next);
        self.teardown().await;
        self.emit(SessionStatus::PartnerLeft);
        self.schedule_reannounce();
    }

    async fn on_request_next(&mut self) {
        tracing::info!("Looking for the next partner");
        if self.server_connected {
            self.send(ClientMessage::Next);
        }
        self.teardown().await;
        self.schedule_reannounce();
    }

    async fn on_server_lost(&mut self) {
        tracing::warn!("Signaling server connection lost");
        self.server_connected = false;
        self.reannounce = None;
        self.teardown().await;
        self.emit(SessionStatus::ServerLost);
    }

    /// Drops the pairing with all its transport resources, queued
    /// candidates and timers, then returns to `Idle`.
    async fn teardown(&mut self) {
        let Some(pairing) = self.pairing.take() else {
            self.state = SessionState::Idle;
            return;
        };
        self.state = SessionState::Disconnected;
        pairing.token.cancel();

        if let Some(transport) = pairing.transport {
            if let Err(err) = transport.close().await {
                tracing::warn!("Could not close peer connection: {err}");
            }
        }
        tracing::debug!(
            "Pairing #{} torn down, {} queued candidate(s) discarded",
            pairing.epoch,
            pairing.candidates.len()
        );
        self.state = SessionState::Idle;
    }
}
