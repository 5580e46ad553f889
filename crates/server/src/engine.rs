use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

use weir_protocol::{FiltersConfig, IceServerConfig, ListenNetwork, ListenSpec, WebrtcConfig};

use crate::connection::MediaKind;

pub use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState as PeerState;
pub use webrtc::rtp::packet::Packet as RtpPacket;

/// The only component that touches the WebRTC engine. Holds one API
/// instance bound to the configured listen port (answering side) and one
/// with ephemeral ports (calling side); with no listen address the same
/// instance serves both roles.
pub struct Engine {
    passive: Arc<API>,
    active: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    filters: FiltersConfig,
}

impl Engine {
    pub async fn new(cfg: &WebrtcConfig) -> Result<Self> {
        let mut passive_setting = SettingEngine::default();

        if !cfg.candidates.is_empty() {
            // Advertise the configured addresses as extra host candidates.
            // Only the host part matters for NAT 1:1 mapping; with a UDP mux
            // the port is the mux port.
            let ips: Vec<String> = cfg
                .candidates
                .iter()
                .map(|c| candidate_host(c).to_string())
                .collect();
            debug!(?ips, "Advertising NAT 1:1 host candidates");
            passive_setting.set_nat_1to1_ips(ips, RTCIceCandidateType::Host);
        }

        let mut muxed = false;
        match ListenSpec::parse(&cfg.listen) {
            Ok(Some(spec)) => {
                if spec.network == ListenNetwork::Tcp {
                    warn!(
                        listen = %cfg.listen,
                        "TCP mux is not supported by the engine, using ephemeral UDP ports"
                    );
                } else {
                    let socket = UdpSocket::bind(&spec.addr)
                        .await
                        .with_context(|| format!("Failed to bind ICE mux socket {}", spec.addr))?;
                    info!(addr = %spec.addr, "WebRTC ICE UDP mux listening");
                    let mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
                    passive_setting.set_udp_network(UDPNetwork::Muxed(mux));
                    muxed = true;
                }
            }
            Ok(None) => {
                debug!("No WebRTC listen address configured, using ephemeral UDP ports");
            }
            Err(e) => {
                // validate() reports this before startup; fail hard if reached.
                anyhow::bail!("invalid webrtc.listen '{}': {e}", cfg.listen);
            }
        }

        let passive = Arc::new(build_api(passive_setting)?);
        let active = if muxed {
            // Outbound calls must not share the answerer's mux socket.
            Arc::new(build_api(SettingEngine::default())?)
        } else {
            Arc::clone(&passive)
        };

        Ok(Self {
            passive,
            active,
            ice_servers: to_rtc_ice_servers(&cfg.ice_servers),
            filters: cfg.filters.clone(),
        })
    }

    /// Create a peer connection. `active = true` means this side initiates
    /// the call; `false` means this side answers. Caller-provided ICE
    /// servers override the configured defaults for this peer only.
    pub async fn new_peer(
        &self,
        active: bool,
        ice_servers: Option<&[IceServerConfig]>,
    ) -> Result<Peer> {
        let api = if active { &self.active } else { &self.passive };
        let servers = match ice_servers {
            Some(list) if !list.is_empty() => to_rtc_ice_servers(list),
            _ => self.ice_servers.clone(),
        };
        let config = RTCConfiguration {
            ice_servers: servers,
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(config)
            .await
            .context("Failed to create peer connection")?;
        Ok(Peer { pc: Arc::new(pc) })
    }

    /// Whether a local candidate may be trickled to the remote.
    pub fn filter_candidate(&self, candidate: &str) -> bool {
        candidate_permitted(&self.filters, candidate)
    }
}

fn build_api(setting_engine: SettingEngine) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .context("Failed to register codecs")?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .context("Failed to register interceptors")?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Host part of a `host:port` candidate, with an optional `udp:`/`tcp:`
/// scope prefix stripped.
fn candidate_host(candidate: &str) -> &str {
    let addr = candidate
        .strip_prefix("udp:")
        .or_else(|| candidate.strip_prefix("tcp:"))
        .unwrap_or(candidate);
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}

/// Candidate line tokens: `candidate:<foundation> <component> <transport>
/// <priority> <address> <port> typ <type> ...`. Anything shorter is left
/// to the engine to reject.
fn candidate_permitted(filters: &FiltersConfig, candidate: &str) -> bool {
    if filters.networks.is_empty() && filters.candidates.is_empty() {
        return true;
    }
    let tokens: Vec<&str> = candidate.split_whitespace().collect();
    if tokens.len() < 6 {
        return true;
    }
    let transport = tokens[2].to_ascii_lowercase();
    let address = tokens[4];

    if !filters.networks.is_empty() && !filters.networks.iter().any(|n| *n == transport) {
        return false;
    }
    if !filters.candidates.is_empty() && !filters.candidates.iter().any(|c| c == address) {
        return false;
    }
    true
}

/// One peer connection behind the adapter surface. Knows nothing about
/// streams or sessions.
#[derive(Clone)]
pub struct Peer {
    pc: Arc<RTCPeerConnection>,
}

impl Peer {
    pub async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("Failed to parse SDP offer")?;
        self.pc
            .set_remote_description(offer)
            .await
            .context("Failed to apply SDP offer")?;
        Ok(())
    }

    /// Produce an answer immediately; candidates trickle afterwards.
    pub async fn create_local_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;
        Ok(answer.sdp)
    }

    /// Produce an answer with all local candidates folded in, waiting for
    /// ICE gathering to complete. Used by the synchronous HTTP path, which
    /// has no channel to trickle over.
    pub async fn complete_local_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .context("Failed to set local description")?;
        let _ = gather_complete.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .context("No local description after ICE gathering")?;
        Ok(local.sdp)
    }

    pub fn on_local_candidate(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        let callback = Arc::new(callback);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let cb = Arc::clone(&callback);
                        cb(json.candidate);
                    }
                    Err(e) => {
                        warn!("Failed to serialize ICE candidate: {e}");
                    }
                }
            }
            Box::pin(async {})
        }));
    }

    pub fn on_connection_state(&self, callback: impl Fn(PeerState) + Send + Sync + 'static) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                callback(state);
                Box::pin(async {})
            }));
    }

    pub fn on_remote_track(&self, callback: impl Fn(Arc<TrackRemote>) + Send + Sync + 'static) {
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                callback(track);
                Box::pin(async {})
            }));
    }

    pub async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        debug!(candidate, "Remote ICE candidate added");
        Ok(())
    }

    /// Create an outbound RTP track and attach it to the peer. The codec
    /// declared here is fuzzy-matched against the remote offer at bind time.
    pub async fn add_egress_track(
        &self,
        kind: MediaKind,
        id: String,
        stream_id: String,
    ) -> Result<(Arc<TrackLocalStaticRTP>, Arc<RTCRtpSender>)> {
        let capability = match kind {
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        };
        let track = Arc::new(TrackLocalStaticRTP::new(capability, id, stream_id));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add egress track")?;
        Ok((track, sender))
    }

    /// Read RTCP from an egress sender and surface PLI/FIR as keyframe
    /// requests. Without this, packet loss on the consumer side leaves the
    /// remote decoder corrupted until the producer's next periodic IDR.
    pub fn spawn_rtcp_reader(
        &self,
        sender: Arc<RTCRtpSender>,
        on_keyframe_request: impl Fn() + Send + Sync + 'static,
    ) {
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for pkt in &packets {
                    let pkt_any = pkt.as_any();
                    if pkt_any.is::<PictureLossIndication>() || pkt_any.is::<FullIntraRequest>() {
                        debug!("Keyframe request from remote consumer");
                        on_keyframe_request();
                    }
                }
            }
        });
    }

    /// Ask the remote producer for a keyframe on the given SSRC.
    pub async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        self.pc
            .write_rtcp(&[Box::new(pli)])
            .await
            .context("Failed to send PLI")?;
        Ok(())
    }

    pub fn connection_state(&self) -> PeerState {
        self.pc.connection_state()
    }

    pub async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")?;
        Ok(())
    }
}
