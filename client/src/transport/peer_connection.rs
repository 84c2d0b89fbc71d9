use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectionState, IceState, PeerTransport, TransportErrors, TransportEvent, TransportEventSink,
    TransportFactory,
};
use crate::config::{IceConfig, IcePolicy};
use crate::media::LocalMedia;

/// Labels a candidate line the way it shows up in connection diagnostics.
pub fn candidate_kind(candidate: &str) -> &'static str {
    if candidate.contains("relay") {
        "TURN"
    } else if candidate.contains("srflx") {
        "STUN"
    } else {
        "HOST"
    }
}

fn rtc_configuration(ice: &IceConfig) -> RTCConfiguration {
    let ice_servers = ice
        .servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_transport_policy: match ice.transport_policy {
            IcePolicy::All => RTCIceTransportPolicy::All,
            IcePolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        ice_candidate_pool_size: ice.candidate_pool_size,
        ..Default::default()
    }
}

impl From<RTCIceConnectionState> for IceState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => IceState::Checking,
            RTCIceConnectionState::Connected => IceState::Connected,
            RTCIceConnectionState::Completed => IceState::Completed,
            RTCIceConnectionState::Disconnected => IceState::Disconnected,
            RTCIceConnectionState::Failed => IceState::Failed,
            RTCIceConnectionState::Closed => IceState::Closed,
            _ => IceState::New,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

pub struct WebrtcTransportFactory {
    webrtc_api: API,
    default_config: RTCConfiguration,
    media: LocalMedia,
}

impl WebrtcTransportFactory {
    pub fn new(ice: &IceConfig, media: LocalMedia) -> Result<Self, TransportErrors> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let webrtc_api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            webrtc_api,
            default_config: rtc_configuration(ice),
            media,
        })
    }

    fn setup_on_ice_candidate(conn: &RTCPeerConnection, events: TransportEventSink) {
        conn.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::info!("ICE gathering completed");
                    events.emit(TransportEvent::GatheringComplete);
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        tracing::error!("Could not serialize local ICE candidate: {err}");
                        return;
                    }
                };
                tracing::info!("ICE candidate gathered ({})", candidate_kind(&init.candidate));
                match serde_json::to_value(&init) {
                    Ok(value) => events.emit(TransportEvent::LocalCandidate(value)),
                    Err(err) => tracing::error!("Could not encode local ICE candidate: {err}"),
                }
            })
        }));
    }

    fn setup_on_state_change(conn: &RTCPeerConnection, events: TransportEventSink) {
        let ice_events = events.clone();
        conn.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::info!("ICE connection state: {state}");
            ice_events.emit(TransportEvent::IceState(state.into()));
            Box::pin(async {})
        }));

        conn.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!("Connection state: {state}");
            events.emit(TransportEvent::ConnectionState(state.into()));
            Box::pin(async {})
        }));
    }

    fn setup_on_track(conn: &RTCPeerConnection, events: TransportEventSink) {
        conn.on_track(Box::new(move |track, _, _| {
            let events = events.clone();
            Box::pin(async move {
                let kind = track.kind().to_string();
                tracing::info!("Received remote {kind} track");
                events.emit(TransportEvent::RemoteTrack { kind: kind.clone() });

                // Rendering lives outside the client; keep the receiver drained.
                while track.read_rtp().await.is_ok() {}
                tracing::warn!("Remote {kind} track ended");
            })
        }));
    }
}

#[async_trait]
impl TransportFactory for WebrtcTransportFactory {
    type Transport = WebrtcTransport;

    async fn create(&self, events: TransportEventSink) -> Result<WebrtcTransport, TransportErrors> {
        tracing::info!("Creating peer connection for pairing #{}", events.epoch());
        let conn = self
            .webrtc_api
            .new_peer_connection(self.default_config.clone())
            .await?;

        for track in self.media.tracks() {
            conn.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            tracing::info!("Track added: {}", track.kind());
        }

        Self::setup_on_ice_candidate(&conn, events.clone());
        Self::setup_on_state_change(&conn, events.clone());
        Self::setup_on_track(&conn, events);

        Ok(WebrtcTransport {
            conn: Arc::new(conn),
        })
    }
}

pub struct WebrtcTransport {
    conn: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebrtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<Value, TransportErrors> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.conn.create_offer(Some(options)).await?;
        Ok(serde_json::to_value(offer)?)
    }

    async fn create_answer(&self) -> Result<Value, TransportErrors> {
        let answer = self.conn.create_answer(None).await?;
        Ok(serde_json::to_value(answer)?)
    }

    async fn set_local_description(&self, description: Value) -> Result<(), TransportErrors> {
        let description: RTCSessionDescription = serde_json::from_value(description)?;
        self.conn.set_local_description(description).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), TransportErrors> {
        let description: RTCSessionDescription = serde_json::from_value(description)?;
        self.conn.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), TransportErrors> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        tracing::debug!("Adding remote ICE candidate ({})", candidate_kind(&candidate.candidate));
        self.conn.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportErrors> {
        self.conn.close().await?;
        Ok(())
    }
}
