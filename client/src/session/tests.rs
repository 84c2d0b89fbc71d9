use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use roulette_model::{ClientId, ClientMessage, PartnerFound, ServerMessage, SignalingMessage};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Duration, Instant};

use super::*;
use crate::transport::{
    ConnectionState, IceState, PeerTransport, TransportErrors, TransportEvent, TransportEventSink,
    TransportFactory,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(Value),
    SetRemote(Value),
    AddCandidate(Value),
    Close,
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    created: Arc<Mutex<Vec<u64>>>,
}

impl Recorder {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|call| *call == wanted).count()
    }

    fn transports_created(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

struct MockTransport {
    recorder: Recorder,
    offer_gate: Option<Arc<Notify>>,
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<Value, TransportErrors> {
        if let Some(gate) = &self.offer_gate {
            gate.notified().await;
        }
        self.recorder.record(Call::CreateOffer { ice_restart });
        Ok(offer(ice_restart))
    }

    async fn create_answer(&self) -> Result<Value, TransportErrors> {
        self.recorder.record(Call::CreateAnswer);
        Ok(answer())
    }

    async fn set_local_description(&self, description: Value) -> Result<(), TransportErrors> {
        self.recorder.record(Call::SetLocal(description));
        Ok(())
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), TransportErrors> {
        self.recorder.record(Call::SetRemote(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), TransportErrors> {
        self.recorder.record(Call::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportErrors> {
        self.recorder.record(Call::Close);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MockFactory {
    recorder: Recorder,
    offer_gate: Option<Arc<Notify>>,
    unavailable: bool,
}

#[async_trait]
impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    async fn create(&self, events: TransportEventSink) -> Result<MockTransport, TransportErrors> {
        if self.unavailable {
            return Err(TransportErrors::NoConnection);
        }
        self.recorder.created.lock().unwrap().push(events.epoch());
        Ok(MockTransport {
            recorder: self.recorder.clone(),
            offer_gate: self.offer_gate.clone(),
        })
    }
}

fn offer(ice_restart: bool) -> Value {
    let sdp = if ice_restart { "v=0 restart" } else { "v=0 initial" };
    json!({ "type": "offer", "sdp": sdp })
}

fn answer() -> Value {
    json!({ "type": "answer", "sdp": "v=0 answer" })
}

fn candidate(n: u32) -> Value {
    json!({ "candidate": format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000{n} typ host"), "sdpMid": "0" })
}

fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

struct Harness {
    session: Session<MockFactory>,
    handle: SessionHandle,
    mailbox: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    status: mpsc::UnboundedReceiver<SessionStatus>,
    recorder: Recorder,
}

impl Harness {
    fn new() -> Self {
        Self::with_factory(MockFactory::default())
    }

    fn with_factory(factory: MockFactory) -> Self {
        Self::with_policy(factory, SessionPolicy::default())
    }

    fn with_policy(factory: MockFactory, policy: SessionPolicy) -> Self {
        let recorder = factory.recorder.clone();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (status_tx, status) = mpsc::unbounded_channel();
        let (session, handle, mailbox) =
            Session::new(factory, policy, outbound_tx, status_tx);
        Self {
            session,
            handle,
            mailbox,
            outbound,
            status,
            recorder,
        }
    }

    async fn ready(&mut self) {
        self.session.handle(SessionEvent::MediaReady).await;
        self.session.handle(SessionEvent::ServerConnected).await;
    }

    async fn paired(&mut self, initiator: bool) -> ClientId {
        self.ready().await;
        let partner = ClientId::new();
        self.partner_found(partner, initiator).await;
        partner
    }

    async fn partner_found(&mut self, partner: ClientId, initiator: bool) {
        self.session
            .handle(SessionEvent::Relay(ServerMessage::PartnerFound(PartnerFound {
                partner_id: partner,
                initiator,
            })))
            .await;
    }

    async fn relay(&mut self, message: SignalingMessage) {
        self.session
            .handle(SessionEvent::Relay(ServerMessage::Signal(message)))
            .await;
    }

    async fn transport(&mut self, event: TransportEvent) {
        let epoch = self.session.epoch();
        self.session
            .handle(SessionEvent::Transport { epoch, event })
            .await;
    }

    /// Feeds the next mailbox event (usually a timer) into the session.
    async fn pump(&mut self) {
        let event = self.mailbox.recv().await.expect("mailbox closed");
        self.session.handle(event).await;
    }

    async fn assert_quiet_for(&mut self, duration: Duration) {
        let result = timeout(duration, self.mailbox.recv()).await;
        assert!(result.is_err(), "Unexpected mailbox event: {result:?}");
    }

    fn sent(&mut self) -> Vec<ClientMessage> {
        drain(&mut self.outbound)
    }

    fn statuses(&mut self) -> Vec<SessionStatus> {
        drain(&mut self.status)
    }
}

#[tokio::test(start_paused = true)]
async fn test_announces_once_media_and_server_are_up() {
    let mut h = Harness::new();

    h.session.handle(SessionEvent::MediaReady).await;
    assert!(h.sent().is_empty());
    assert_eq!(h.session.state(), SessionState::Idle);

    h.session.handle(SessionEvent::ServerConnected).await;
    assert_eq!(h.sent(), vec![ClientMessage::Ready]);
    assert_eq!(h.session.state(), SessionState::AwaitingPartner);
    assert_eq!(h.statuses(), vec![SessionStatus::Searching]);

    h.session.handle(SessionEvent::MediaReady).await;
    assert!(h.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_initiator_offers_on_pairing() {
    let mut h = Harness::new();
    let partner = h.paired(true).await;

    assert_eq!(h.session.state(), SessionState::Connecting);
    assert_eq!(h.session.partner(), Some(partner));
    assert_eq!(
        h.sent(),
        vec![
            ClientMessage::Ready,
            ClientMessage::Signal(SignalingMessage::Offer { offer: offer(false) }),
        ]
    );
    assert_eq!(
        h.recorder.calls(),
        vec![
            Call::CreateOffer { ice_restart: false },
            Call::SetLocal(offer(false)),
        ]
    );
    assert!(h.statuses().contains(&SessionStatus::PartnerFound {
        partner,
        role: Role::Initiator
    }));
}

#[tokio::test(start_paused = true)]
async fn test_responder_answers_and_flushes_queue() {
    let mut h = Harness::new();
    h.paired(false).await;
    assert_eq!(h.recorder.transports_created(), 0);
    h.sent();

    h.relay(SignalingMessage::Candidate { candidate: candidate(1) }).await;
    h.relay(SignalingMessage::Candidate { candidate: candidate(2) }).await;
    assert_eq!(h.session.queued_candidates(), 2);
    assert!(h.recorder.calls().is_empty());

    h.relay(SignalingMessage::Offer { offer: offer(false) }).await;

    assert_eq!(h.recorder.transports_created(), 1);
    assert_eq!(
        h.recorder.calls(),
        vec![
            Call::SetRemote(offer(false)),
            Call::AddCandidate(candidate(1)),
            Call::AddCandidate(candidate(2)),
            Call::CreateAnswer,
            Call::SetLocal(answer()),
        ]
    );
    assert_eq!(h.session.queued_candidates(), 0);
    assert_eq!(
        h.sent(),
        vec![ClientMessage::Signal(SignalingMessage::Answer { answer: answer() })]
    );
}

#[tokio::test(start_paused = true)]
async fn test_candidates_applied_in_arrival_order_after_answer() {
    let mut h = Harness::new();
    h.paired(true).await;

    for n in 0..5 {
        h.relay(SignalingMessage::Candidate { candidate: candidate(n) }).await;
    }
    assert_eq!(h.session.queued_candidates(), 5);

    h.relay(SignalingMessage::Answer { answer: answer() }).await;
    h.relay(SignalingMessage::Candidate { candidate: candidate(9) }).await;

    let applied: Vec<_> = h
        .recorder
        .calls()
        .into_iter()
        .skip_while(|call| *call != Call::SetRemote(answer()))
        .collect();
    let mut expected = vec![Call::SetRemote(answer())];
    expected.extend((0..5).map(|n| Call::AddCandidate(candidate(n))));
    expected.push(Call::AddCandidate(candidate(9)));
    assert_eq!(applied, expected);
    assert_eq!(h.session.queued_candidates(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_partner_found_ignored() {
    let mut h = Harness::new();
    let partner = h.paired(true).await;
    let epoch = h.session.epoch();

    h.partner_found(partner, true).await;
    h.partner_found(ClientId::new(), false).await;

    assert_eq!(h.session.epoch(), epoch);
    assert_eq!(h.session.partner(), Some(partner));
    assert_eq!(h.recorder.count(&Call::CreateOffer { ice_restart: false }), 1);
    assert_eq!(h.recorder.transports_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ready_rejected_while_paired() {
    let mut h = Harness::new();
    h.paired(false).await;
    h.sent();

    h.session.handle(SessionEvent::MediaReady).await;
    h.session.handle(SessionEvent::ServerConnected).await;

    assert!(h.sent().is_empty());
    assert_eq!(h.session.state(), SessionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_answer_without_pending_offer_dropped() {
    let mut h = Harness::new();
    h.paired(false).await;

    h.relay(SignalingMessage::Answer { answer: answer() }).await;

    assert!(h.recorder.calls().is_empty());
    assert_eq!(h.session.state(), SessionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_offer_during_own_offer_dropped() {
    let mut h = Harness::new();
    h.paired(true).await;
    let before = h.recorder.calls();

    h.relay(SignalingMessage::Offer { offer: offer(false) }).await;

    assert_eq!(h.recorder.calls(), before);
}

#[tokio::test(start_paused = true)]
async fn test_signal_without_partner_dropped() {
    let mut h = Harness::new();
    h.ready().await;
    h.sent();

    h.relay(SignalingMessage::Candidate { candidate: candidate(1) }).await;
    h.relay(SignalingMessage::Offer { offer: offer(false) }).await;

    assert!(h.recorder.calls().is_empty());
    assert_eq!(h.recorder.transports_created(), 0);
    assert!(h.sent().is_empty());
    assert_eq!(h.session.state(), SessionState::AwaitingPartner);
}

#[tokio::test(start_paused = true)]
async fn test_local_candidates_relayed() {
    let mut h = Harness::new();
    h.paired(true).await;
    h.sent();

    h.transport(TransportEvent::LocalCandidate(candidate(3))).await;

    assert_eq!(
        h.sent(),
        vec![ClientMessage::Signal(SignalingMessage::Candidate { candidate: candidate(3) })]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stalled_checking_restarts_ice_once() {
    let mut h = Harness::new();
    let partner = h.paired(true).await;
    h.relay(SignalingMessage::Answer { answer: answer() }).await;
    h.sent();

    let start = Instant::now();
    h.transport(TransportEvent::IceState(IceState::Checking)).await;
    h.transport(TransportEvent::IceState(IceState::Checking)).await;

    h.pump().await;

    assert!(start.elapsed() >= Duration::from_secs(15));
    assert_eq!(h.session.ice_restarts(), 1);
    assert_eq!(h.session.state(), SessionState::Connecting);
    assert_eq!(h.session.partner(), Some(partner));
    assert_eq!(h.recorder.count(&Call::CreateOffer { ice_restart: true }), 1);
    assert_eq!(h.recorder.count(&Call::Close), 0);
    assert_eq!(
        h.sent(),
        vec![ClientMessage::Signal(SignalingMessage::Offer { offer: offer(true) })]
    );
    assert!(h.statuses().contains(&SessionStatus::IceRestart));

    h.assert_quiet_for(Duration::from_secs(60)).await;
    assert_eq!(h.session.ice_restarts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_responder_waits_for_restart_offer() {
    let mut h = Harness::new();
    h.paired(false).await;
    h.relay(SignalingMessage::Offer { offer: offer(false) }).await;
    h.sent();

    h.transport(TransportEvent::IceState(IceState::Checking)).await;
    h.pump().await;

    assert_eq!(h.session.ice_restarts(), 1);
    assert_eq!(h.recorder.count(&Call::CreateOffer { ice_restart: true }), 0);
    assert!(h.sent().is_empty());

    h.relay(SignalingMessage::Offer { offer: offer(true) }).await;
    assert_eq!(h.recorder.count(&Call::SetRemote(offer(true))), 1);
    assert_eq!(
        h.sent(),
        vec![ClientMessage::Signal(SignalingMessage::Answer { answer: answer() })]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connected_cancels_checking_timer() {
    let mut h = Harness::new();
    h.paired(true).await;
    h.relay(SignalingMessage::Answer { answer: answer() }).await;

    h.transport(TransportEvent::IceState(IceState::Checking)).await;
    h.transport(TransportEvent::IceState(IceState::Connected)).await;

    assert_eq!(h.session.state(), SessionState::Connected);
    h.assert_quiet_for(Duration::from_secs(30)).await;
    assert_eq!(h.session.ice_restarts(), 0);
    assert!(h.statuses().contains(&SessionStatus::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_failure_retries_once_then_stays_failed() {
    let mut h = Harness::new();
    h.paired(true).await;
    h.relay(SignalingMessage::Answer { answer: answer() }).await;
    h.statuses();

    h.transport(TransportEvent::IceState(IceState::Failed)).await;
    h.transport(TransportEvent::ConnectionState(ConnectionState::Failed)).await;
    assert_eq!(h.session.state(), SessionState::Failed);
    assert_eq!(h.statuses(), vec![SessionStatus::Retrying { attempt: 1 }]);

    let start = Instant::now();
    h.pump().await;
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(h.session.state(), SessionState::Connecting);
    assert_eq!(h.recorder.count(&Call::CreateOffer { ice_restart: true }), 1);

    h.relay(SignalingMessage::Answer { answer: answer() }).await;
    h.transport(TransportEvent::ConnectionState(ConnectionState::Failed)).await;

    assert_eq!(h.session.state(), SessionState::Failed);
    assert_eq!(h.statuses(), vec![SessionStatus::Failed]);
    assert!(SessionStatus::Failed.is_blocking());
    h.assert_quiet_for(Duration::from_secs(60)).await;
    assert_eq!(h.session.state(), SessionState::Failed);
    assert_eq!(h.session.retries(), 1);
    assert_eq!(h.recorder.count(&Call::CreateOffer { ice_restart: true }), 1);
}

#[tokio::test(start_paused = true)]
async fn test_next_recovers_from_terminal_failure() {
    let mut h = Harness::with_policy(
        MockFactory::default(),
        SessionPolicy {
            max_retries: 0,
            ..Default::default()
        },
    );

    h.paired(true).await;
    h.transport(TransportEvent::IceState(IceState::Failed)).await;
    assert_eq!(h.session.state(), SessionState::Failed);
    h.sent();

    h.session.handle(SessionEvent::RequestNext).await;
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.sent(), vec![ClientMessage::Next]);
}

#[tokio::test(start_paused = true)]
async fn test_partner_left_cleans_up_and_reannounces() {
    let mut h = Harness::new();
    h.paired(true).await;
    h.relay(SignalingMessage::Candidate { candidate: candidate(1) }).await;
    h.sent();

    h.session
        .handle(SessionEvent::Relay(ServerMessage::PartnerDisconnected))
        .await;

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.session.partner(), None);
    assert_eq!(h.session.queued_candidates(), 0);
    assert_eq!(h.recorder.count(&Call::Close), 1);
    assert!(h.statuses().contains(&SessionStatus::PartnerLeft));
    assert!(h.sent().is_empty());

    let start = Instant::now();
    h.pump().await;
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert_eq!(h.sent(), vec![ClientMessage::Ready]);
    assert_eq!(h.session.state(), SessionState::AwaitingPartner);
}

#[tokio::test(start_paused = true)]
async fn test_local_disconnect_releases_pairing() {
    let mut h = Harness::new();
    h.paired(true).await;
    h.sent();

    h.transport(TransportEvent::ConnectionState(ConnectionState::Disconnected))
        .await;

    assert_eq!(h.sent(), vec![ClientMessage::Next]);
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.recorder.count(&Call::Close), 1);

    h.pump().await;
    assert_eq!(h.sent(), vec![ClientMessage::Ready]);
}

#[tokio::test(start_paused = true)]
async fn test_request_next_cancels_inflight_negotiation() {
    let gate = Arc::new(Notify::new());
    let h = Harness::with_factory(MockFactory {
        offer_gate: Some(gate),
        ..Default::default()
    });
    let Harness {
        mut session,
        handle,
        mut mailbox,
        mut outbound,
        recorder,
        ..
    } = h;
    session.handle(SessionEvent::MediaReady).await;
    session.handle(SessionEvent::ServerConnected).await;

    let negotiation = tokio::spawn(async move {
        session
            .handle(SessionEvent::Relay(ServerMessage::PartnerFound(PartnerFound {
                partner_id: ClientId::new(),
                initiator: true,
            })))
            .await;
        session
    });
    while recorder.transports_created() == 0 {
        tokio::task::yield_now().await;
    }

    handle.request_next();
    let mut session = negotiation.await.unwrap();

    assert_eq!(drain(&mut outbound), vec![ClientMessage::Ready]);
    assert_eq!(recorder.count(&Call::CreateOffer { ice_restart: false }), 0);

    let event = mailbox.recv().await.unwrap();
    assert!(matches!(event, SessionEvent::RequestNext));
    session.handle(event).await;

    assert_eq!(drain(&mut outbound), vec![ClientMessage::Next]);
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.partner(), None);
    assert_eq!(recorder.count(&Call::Close), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_pairing_events_ignored() {
    let mut h = Harness::new();
    h.paired(true).await;
    let stale = h.session.epoch();

    h.session
        .handle(SessionEvent::Relay(ServerMessage::PartnerDisconnected))
        .await;
    h.pump().await;
    h.partner_found(ClientId::new(), true).await;
    assert_eq!(h.session.epoch(), stale + 1);

    h.session
        .handle(SessionEvent::Transport {
            epoch: stale,
            event: TransportEvent::IceState(IceState::Failed),
        })
        .await;
    h.session
        .handle(SessionEvent::TimerFired {
            epoch: stale,
            kind: TimerKind::IceChecking,
        })
        .await;

    assert_eq!(h.session.state(), SessionState::Connecting);
    assert_eq!(h.session.ice_restarts(), 0);
    assert_eq!(h.session.retries(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_server_loss_tears_down_until_reconnect() {
    let mut h = Harness::new();
    h.paired(true).await;
    h.sent();

    h.session.handle(SessionEvent::ServerDisconnected).await;

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.recorder.count(&Call::Close), 1);
    assert!(h.statuses().contains(&SessionStatus::ServerLost));
    h.assert_quiet_for(Duration::from_secs(5)).await;
    assert!(h.sent().is_empty());

    h.session.handle(SessionEvent::ServerConnected).await;
    assert_eq!(h.sent(), vec![ClientMessage::Ready]);
    assert_eq!(h.session.state(), SessionState::AwaitingPartner);
}

#[tokio::test(start_paused = true)]
async fn test_media_denied_blocks_matching() {
    let mut h = Harness::new();

    h.session
        .handle(SessionEvent::MediaDenied("no camera".to_owned()))
        .await;
    h.session.handle(SessionEvent::ServerConnected).await;

    assert!(h.sent().is_empty());
    assert_eq!(h.session.state(), SessionState::Idle);
    let statuses = h.statuses();
    assert_eq!(statuses, vec![SessionStatus::MediaDenied("no camera".to_owned())]);
    assert!(statuses[0].is_blocking());
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_transport_counts_as_failure() {
    let mut h = Harness::with_factory(MockFactory {
        unavailable: true,
        ..Default::default()
    });

    h.paired(true).await;

    assert_eq!(h.session.state(), SessionState::Failed);
    assert!(h.statuses().contains(&SessionStatus::Retrying { attempt: 1 }));

    // The retry tries to create the transport again and fails for good
    h.pump().await;
    assert_eq!(h.session.state(), SessionState::Failed);
    assert_eq!(h.statuses(), vec![SessionStatus::Failed]);
    assert_eq!(h.session.retries(), 1);
    assert_eq!(h.recorder.transports_created(), 0);
    assert!(h.recorder.calls().is_empty());
    h.assert_quiet_for(Duration::from_secs(60)).await;
}

#[tokio::test(start_paused = true)]
async fn test_partner_found_after_next_ignored() {
    let mut h = Harness::new();
    h.ready().await;
    h.session.handle(SessionEvent::RequestNext).await;
    assert_eq!(h.sent(), vec![ClientMessage::Ready, ClientMessage::Next]);

    // Pairing the server released when it handled our next
    h.partner_found(ClientId::new(), true).await;

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.session.partner(), None);
    assert_eq!(h.recorder.transports_created(), 0);
    assert!(h.sent().is_empty());

    h.pump().await;
    assert_eq!(h.sent(), vec![ClientMessage::Ready]);
    assert_eq!(h.session.state(), SessionState::AwaitingPartner);

    let partner = ClientId::new();
    h.partner_found(partner, true).await;
    assert_eq!(h.session.partner(), Some(partner));
    assert_eq!(h.session.state(), SessionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown() {
    let h = Harness::new();
    let Harness {
        session,
        handle,
        mailbox,
        mut outbound,
        ..
    } = h;
    let task = tokio::spawn(session.run(mailbox));

    handle.send(SessionEvent::MediaReady);
    handle.send(SessionEvent::ServerConnected);
    handle.shutdown();

    timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_eq!(drain(&mut outbound), vec![ClientMessage::Ready]);
}
