//! Test doubles for the connection contract.

use super::{ConnectionEvent, PeerConnection, SdpAnswer, SessionDescription, SignalingError, TransportState};
use super::signaling::SignalingConnectionFactory;
use crate::config::WebRtcConfig;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice::mdns::MulticastDnsMode;

/// A browser offer with one audio section, as sent by Chrome.
pub(crate) const OFFER: &str = "v=0\r\n\
    o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    a=group:BUNDLE 0\r\n\
    a=extmap-allow-mixed\r\n\
    a=msid-semantic: WMS\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=rtcp:9 IN IP4 0.0.0.0\r\n\
    a=candidate:1 1 udp 2122260223 192.0.2.10 54321 typ host\r\n\
    a=ice-ufrag:abcd\r\n\
    a=ice-pwd:0123456789abcdef01234567\r\n\
    a=ice-options:trickle\r\n\
    a=fingerprint:sha-256 0B:30:55:7A:9F:C4:E9:0E:33:58:7D:A2:C7:EC:11:36:5B:80:A5:CA:EF:14:39:5E:83:A8:CD:F2:17:3C:61:86\r\n\
    a=setup:actpass\r\n\
    a=mid:0\r\n\
    a=sendrecv\r\n\
    a=msid:- 7c1b1f5d-mic\r\n\
    a=rtcp-mux\r\n\
    a=rtpmap:111 opus/48000/2\r\n\
    a=rtcp-fb:111 transport-cc\r\n\
    a=fmtp:111 minptime=10;useinbandfec=1\r\n\
    a=ssrc:1001 cname:wilbur-test\r\n";

/// Certificate fingerprint carried by [`OFFER`].
pub(crate) const OFFER_FINGERPRINT: &str = "sha-256 0B:30:55:7A:9F:C4:E9:0E:33:58:7D:A2:C7:EC:11:36:5B:80:A5:CA:EF:14:39:5E:83:A8:CD:F2:17:3C:61:86";

/// Settings for peers that only ever talk to this host: loopback candidates
/// are offered and mDNS is off.
pub(crate) fn local_settings() -> SettingEngine {
    let mut settings = SettingEngine::default();
    settings.set_include_loopback_candidate(true);
    settings.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
    settings
}

/// Real connection factory without STUN servers, so gathering finishes locally.
pub(crate) fn local_factory() -> SignalingConnectionFactory {
    let config = WebRtcConfig {
        ice_servers: Vec::new(),
        ice_gathering_timeout_secs: 5,
    };
    SignalingConnectionFactory::with_settings(&config, local_settings()).unwrap()
}

/// Connection that records what the registry does to it.
pub struct MockConnection {
    id: String,
    state: Mutex<Option<TransportState>>,
    disconnects: AtomicUsize,
    fail_disconnect: AtomicBool,
    panic_disconnect: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl MockConnection {
    /// A connection that cannot report its transport state.
    pub fn new(id: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(8);
        Arc::new(Self {
            id: id.to_string(),
            state: Mutex::new(None),
            disconnects: AtomicUsize::new(0),
            fail_disconnect: AtomicBool::new(false),
            panic_disconnect: AtomicBool::new(false),
            events,
        })
    }

    pub fn set_state(&self, state: Option<TransportState>) {
        *self.state.lock().unwrap() = state;
    }

    pub fn fail_disconnects(&self) {
        self.fail_disconnect.store(true, Ordering::SeqCst);
    }

    /// Make every later disconnect panic after counting the attempt.
    pub fn panic_disconnects(&self) {
        self.panic_disconnect.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn pc_id(&self) -> &str {
        &self.id
    }

    async fn renegotiate(
        &self,
        _offer: SessionDescription,
        _restart: bool,
    ) -> Result<(), SignalingError> {
        Ok(())
    }

    fn answer(&self) -> Option<SdpAnswer> {
        Some(SdpAnswer {
            sdp: "v=0\r\n".to_string(),
            kind: "answer".to_string(),
            pc_id: self.id.clone(),
        })
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to interleave.
        tokio::task::yield_now().await;
        if self.panic_disconnect.load(Ordering::SeqCst) {
            panic!("transport teardown panicked for {}", self.id);
        }
        if self.fail_disconnect.load(Ordering::SeqCst) {
            anyhow::bail!("transport already torn down");
        }
        Ok(())
    }

    fn state(&self) -> Option<TransportState> {
        *self.state.lock().unwrap()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
