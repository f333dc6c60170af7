//! WebRTC peer connections for the signaling endpoint.
//!
//! Each [`SignalingConnection`] wraps a `webrtc` [`RTCPeerConnection`]. The
//! answer is produced by the ICE/DTLS stack itself and carries the gathered
//! local candidates. Peer connection state changes are forwarded to the
//! connection's notification channel, which is what the session registry
//! listens to.

use super::{
    ConnectionEvent, ConnectionFactory, PeerConnection, SdpAnswer, SessionDescription,
    SignalingError, TransportState,
};
use crate::config::WebRtcConfig;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Capacity of the per-connection notification channel. Subscribers only ever
/// need the first terminal event, so a small buffer is plenty.
const EVENT_CAPACITY: usize = 8;

/// State shared with the callbacks registered on the underlying peer.
struct Shared {
    pc_id: String,
    /// Bumped every time the underlying peer is replaced. Callbacks from an
    /// older peer are ignored.
    generation: AtomicU64,
    state: Mutex<TransportState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn report_state(&self, generation: u64, state: TransportState) {
        if generation != self.generation.load(Ordering::SeqCst) {
            trace!(pc_id = %self.pc_id, generation, state = %state, "Ignoring state of replaced peer");
            return;
        }

        let previous = std::mem::replace(&mut *self.lock_state(), state);
        if previous == state {
            return;
        }

        debug!(pc_id = %self.pc_id, from = %previous, to = %state, "Transport state changed");

        let event = match state {
            TransportState::Connected => Some(ConnectionEvent::Connected),
            TransportState::Closed => Some(ConnectionEvent::Closed),
            TransportState::Failed => Some(ConnectionEvent::Failed),
            _ => None,
        };
        if let Some(event) = event {
            // No subscribers is fine: the sweeper still sees the terminal state.
            let _ = self.events.send(event);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                TransportState::New
            }
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
        }
    }
}

pub struct SignalingConnection {
    shared: Arc<Shared>,
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    gathering_timeout: Duration,
    /// Held across a whole negotiation so offers for one connection never interleave.
    peer: tokio::sync::Mutex<Arc<RTCPeerConnection>>,
    answer: Mutex<String>,
}

impl SignalingConnection {
    async fn negotiate(
        factory: &SignalingConnectionFactory,
        pc_id: String,
        offer: &SessionDescription,
    ) -> Result<Self, SignalingError> {
        check_offer_type(offer)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            pc_id,
            generation: AtomicU64::new(0),
            state: Mutex::new(TransportState::New),
            events,
        });

        let peer = new_peer(&factory.api, &factory.ice_servers, &shared).await?;
        let answer = match answer_offer(&peer, offer, factory.gathering_timeout, &shared.pc_id).await {
            Ok(answer) => answer,
            Err(err) => {
                close_peer(&peer, &shared.pc_id).await;
                return Err(err);
            }
        };

        debug!(
            pc_id = %shared.pc_id,
            ice_servers = factory.ice_servers.len(),
            "Initialized peer connection"
        );

        Ok(Self {
            shared,
            api: Arc::clone(&factory.api),
            ice_servers: factory.ice_servers.clone(),
            gathering_timeout: factory.gathering_timeout,
            peer: tokio::sync::Mutex::new(peer),
            answer: Mutex::new(answer),
        })
    }

    #[cfg(test)]
    async fn peer(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&*self.peer.lock().await)
    }
}

#[async_trait]
impl PeerConnection for SignalingConnection {
    fn pc_id(&self) -> &str {
        &self.shared.pc_id
    }

    async fn renegotiate(
        &self,
        offer: SessionDescription,
        restart: bool,
    ) -> Result<(), SignalingError> {
        check_offer_type(&offer)?;

        let mut peer = self.peer.lock().await;
        if self.shared.lock_state().is_terminal() {
            return Err(SignalingError::ConnectionClosed(self.shared.pc_id.clone()));
        }

        if restart {
            info!(pc_id = %self.shared.pc_id, "Restarting peer connection");
            let fresh = new_peer(&self.api, &self.ice_servers, &self.shared).await?;
            let replaced = std::mem::replace(&mut *peer, fresh);
            close_peer(&replaced, &self.shared.pc_id).await;
        }

        let answer = answer_offer(&peer, &offer, self.gathering_timeout, &self.shared.pc_id).await?;
        *self.answer.lock().unwrap_or_else(PoisonError::into_inner) = answer;

        debug!(pc_id = %self.shared.pc_id, restart, "Renegotiated peer connection");
        Ok(())
    }

    fn answer(&self) -> Option<SdpAnswer> {
        let sdp = self.answer.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(SdpAnswer {
            sdp,
            kind: "answer".to_string(),
            pc_id: self.shared.pc_id.clone(),
        })
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        let peer = Arc::clone(&*self.peer.lock().await);
        peer.close().await?;

        let generation = self.shared.generation.load(Ordering::SeqCst);
        self.shared.report_state(generation, TransportState::Closed);
        debug!(pc_id = %self.shared.pc_id, "Peer connection disconnected");
        Ok(())
    }

    fn state(&self) -> Option<TransportState> {
        Some(*self.shared.lock_state())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }
}

fn check_offer_type(offer: &SessionDescription) -> Result<(), SignalingError> {
    if offer.kind != "offer" {
        return Err(SignalingError::UnexpectedType(offer.kind.clone()));
    }
    Ok(())
}

/// Create a peer and route its state changes into `shared` under a new generation.
async fn new_peer(
    api: &API,
    ice_servers: &[RTCIceServer],
    shared: &Arc<Shared>,
) -> Result<Arc<RTCPeerConnection>, SignalingError> {
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let config = RTCConfiguration {
        ice_servers: ice_servers.to_vec(),
        ..Default::default()
    };
    let peer = api
        .new_peer_connection(config)
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))?;

    let weak: Weak<Shared> = Arc::downgrade(shared);
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if let Some(shared) = weak.upgrade() {
            shared.report_state(generation, TransportState::from(state));
        }
        Box::pin(async {})
    }));

    Ok(Arc::new(peer))
}

/// Apply the remote offer and return the local answer once candidates are gathered.
async fn answer_offer(
    peer: &RTCPeerConnection,
    offer: &SessionDescription,
    gathering_timeout: Duration,
    pc_id: &str,
) -> Result<String, SignalingError> {
    let remote = RTCSessionDescription::offer(offer.sdp.clone())
        .map_err(|e| SignalingError::MalformedSdp(e.to_string()))?;
    peer.set_remote_description(remote)
        .await
        .map_err(|e| SignalingError::MalformedSdp(e.to_string()))?;

    let answer = peer
        .create_answer(None)
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))?;

    let mut gathered = peer.gathering_complete_promise().await;
    peer.set_local_description(answer)
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))?;

    if tokio::time::timeout(gathering_timeout, gathered.recv())
        .await
        .is_err()
    {
        warn!(
            pc_id = %pc_id,
            "ICE gathering did not finish within {:?}, answering with the candidates so far",
            gathering_timeout
        );
    }

    peer.local_description()
        .await
        .map(|description| description.sdp)
        .ok_or_else(|| SignalingError::Transport("no local description after answering".to_string()))
}

async fn close_peer(peer: &RTCPeerConnection, pc_id: &str) {
    if let Err(err) = peer.close().await {
        warn!(pc_id = %pc_id, "Error closing peer connection: {}", err);
    }
}

/// Builds a [`SignalingConnection`] with a fresh `pc_id` for every new client.
#[derive(Clone)]
pub struct SignalingConnectionFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    gathering_timeout: Duration,
}

impl SignalingConnectionFactory {
    pub fn new(config: &WebRtcConfig) -> anyhow::Result<Self> {
        Self::with_settings(config, SettingEngine::default())
    }

    /// Build on a custom `SettingEngine` (ICE timeouts, candidate filters).
    pub fn with_settings(config: &WebRtcConfig, settings: SettingEngine) -> anyhow::Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let interceptors = register_default_interceptors(Registry::new(), &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(interceptors)
            .with_setting_engine(settings)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
            gathering_timeout: config.ice_gathering_timeout(),
        })
    }

    pub async fn connect(
        &self,
        offer: SessionDescription,
    ) -> Result<Arc<SignalingConnection>, SignalingError> {
        let pc_id = format!("pc-{}", Uuid::new_v4());
        let connection = SignalingConnection::negotiate(self, pc_id, &offer).await?;
        Ok(Arc::new(connection))
    }
}

#[async_trait]
impl ConnectionFactory for SignalingConnectionFactory {
    async fn create(
        &self,
        offer: SessionDescription,
    ) -> Result<Arc<dyn PeerConnection>, SignalingError> {
        let connection: Arc<dyn PeerConnection> = self.connect(offer).await?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{local_factory, local_settings, OFFER, OFFER_FINGERPRINT};
    use crate::session::registry::tests::{spawn_worker, wait_until, CountingPipeline};
    use crate::session::{RegistryConfig, SessionRegistry};

    fn attribute<'a>(sdp: &'a str, name: &str) -> Option<&'a str> {
        let prefix = format!("a={}:", name);
        sdp.lines()
            .find_map(|line| line.strip_prefix(prefix.as_str()))
            .map(str::trim)
    }

    fn register(registry: &SessionRegistry, connection: Arc<SignalingConnection>) {
        let worker = spawn_worker(
            registry,
            connection.pc_id(),
            Arc::new(CountingPipeline::default()),
        );
        registry
            .register(connection.pc_id().to_string(), connection, worker)
            .unwrap();
    }

    #[tokio::test]
    async fn test_answer_comes_from_the_ice_stack() {
        let factory = local_factory();
        let connection = factory.connect(SessionDescription::offer(OFFER)).await.unwrap();

        let answer = connection.answer().unwrap();
        assert!(answer.pc_id.starts_with("pc-"));
        assert_eq!(answer.kind, "answer");
        assert!(answer.sdp.starts_with("v=0\r\n"));
        assert!(answer.sdp.contains("a=candidate:"));

        let fingerprint = attribute(&answer.sdp, "fingerprint").unwrap();
        assert!(fingerprint.starts_with("sha-256 "));
        assert_ne!(fingerprint, OFFER_FINGERPRINT);
        assert_eq!(attribute(&answer.sdp, "setup"), Some("active"));
        assert_ne!(attribute(&answer.sdp, "ice-ufrag"), Some("abcd"));

        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_offers_that_are_not_offers_are_rejected() {
        let factory = local_factory();

        let result = factory
            .connect(SessionDescription {
                sdp: OFFER.to_string(),
                kind: "answer".to_string(),
            })
            .await;
        assert!(matches!(result, Err(SignalingError::UnexpectedType(kind)) if kind == "answer"));

        let result = factory.connect(SessionDescription::offer("not sdp")).await;
        assert!(matches!(result, Err(SignalingError::MalformedSdp(_))));
    }

    #[tokio::test]
    async fn test_restart_replaces_the_peer_and_keeps_the_id() {
        let factory = local_factory();
        let connection = factory.connect(SessionDescription::offer(OFFER)).await.unwrap();
        let first = connection.answer().unwrap();

        connection
            .renegotiate(SessionDescription::offer(OFFER), false)
            .await
            .unwrap();
        let second = connection.answer().unwrap();
        assert_eq!(
            attribute(&first.sdp, "ice-ufrag"),
            attribute(&second.sdp, "ice-ufrag")
        );

        let mut events = connection.subscribe();
        connection
            .renegotiate(SessionDescription::offer(OFFER), true)
            .await
            .unwrap();
        let third = connection.answer().unwrap();

        assert_eq!(third.pc_id, first.pc_id);
        assert_ne!(
            attribute(&second.sdp, "ice-ufrag"),
            attribute(&third.sdp, "ice-ufrag")
        );
        assert_ne!(
            attribute(&second.sdp, "fingerprint"),
            attribute(&third.sdp, "fingerprint")
        );
        // Closing the replaced peer is not a session close.
        assert!(!connection.state().unwrap().is_terminal());
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_publishes_closed() {
        let factory = local_factory();
        let connection = factory.connect(SessionDescription::offer(OFFER)).await.unwrap();
        let mut events = connection.subscribe();

        connection.disconnect().await.unwrap();
        connection.disconnect().await.unwrap();

        assert_eq!(connection.state(), Some(TransportState::Closed));
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        let result = connection
            .renegotiate(SessionDescription::offer(OFFER), false)
            .await;
        assert!(matches!(result, Err(SignalingError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_peer_closing_on_its_own_removes_the_session() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let connection = local_factory()
            .connect(SessionDescription::offer(OFFER))
            .await
            .unwrap();
        let pc_id = connection.pc_id().to_string();
        register(&registry, Arc::clone(&connection));

        connection.peer().await.close().await.unwrap();

        wait_until(|| !registry.contains(&pc_id)).await;
        assert_eq!(connection.state(), Some(TransportState::Closed));
    }

    #[tokio::test]
    async fn test_unreachable_client_fails_and_is_removed() {
        let mut settings = local_settings();
        settings.set_ice_timeouts(
            Some(Duration::from_millis(500)),
            Some(Duration::from_millis(500)),
            Some(Duration::from_millis(100)),
        );
        let factory = SignalingConnectionFactory::with_settings(
            &WebRtcConfig {
                ice_servers: Vec::new(),
                ice_gathering_timeout_secs: 5,
            },
            settings,
        )
        .unwrap();

        let registry = SessionRegistry::new(RegistryConfig::default());
        let connection = factory.connect(SessionDescription::offer(OFFER)).await.unwrap();
        let pc_id = connection.pc_id().to_string();
        let mut events = connection.subscribe();
        register(&registry, Arc::clone(&connection));

        // The offer's only candidate is in TEST-NET-1, so checks never succeed.
        let failed = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Failed) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;
        assert_eq!(failed, Ok(true));
        wait_until(|| !registry.contains(&pc_id)).await;
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let factory = local_factory();
        let a = factory.connect(SessionDescription::offer(OFFER)).await.unwrap();
        let b = factory.connect(SessionDescription::offer(OFFER)).await.unwrap();
        assert_ne!(a.pc_id(), b.pc_id());
        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
    }
}
