use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{debug, info, trace};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::sdp::description::session::SessionDescription;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use weir_protocol::SessionEntry;

use crate::engine::{Peer, RtpPacket};

/// Role of a session, fixed at creation. The server never initiates the
/// exchange, so both roles are passive (answering) peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Egress: the remote receives media from the server
    PassiveConsumer,
    /// Ingress: the remote publishes media to the server
    PassiveProducer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::PassiveConsumer => write!(f, "passive consumer"),
            Mode::PassiveProducer => write!(f, "passive producer"),
        }
    }
}

/// Which signaling channel created the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalProtocol {
    Ws,
    Http,
}

impl fmt::Display for SignalProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalProtocol::Ws => write!(f, "ws"),
            SignalProtocol::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Direction from this side's perspective: `SendOnly` means the server
/// sends, i.e. the remote offered `recvonly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct Media {
    pub kind: MediaKind,
    pub direction: Direction,
}

/// Parse the media sections of an offer into kind/direction pairs, with
/// directions flipped to this side's perspective. `sendrecv` counts as
/// sendable; `inactive` sections and non-media sections (datachannel)
/// are skipped.
pub fn parse_medias(sdp: &str) -> Result<Vec<Media>> {
    let sd = SessionDescription::unmarshal(&mut Cursor::new(sdp.as_bytes()))
        .context("Failed to parse SDP")?;

    let mut medias = Vec::new();
    for md in &sd.media_descriptions {
        let kind = match md.media_name.media.as_str() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            _ => continue,
        };
        // Absent direction attribute means sendrecv.
        let mut direction = Some(Direction::SendOnly);
        for attr in &md.attributes {
            match attr.key.as_str() {
                "recvonly" | "sendrecv" => direction = Some(Direction::SendOnly),
                "sendonly" => direction = Some(Direction::RecvOnly),
                "inactive" => direction = None,
                _ => continue,
            }
            break;
        }
        if let Some(direction) = direction {
            medias.push(Media { kind, direction });
        }
    }
    Ok(medias)
}

/// Classify a session whose signaling channel did not state its role.
/// Used only by the synchronous HTTP path; the async path decides from
/// the `src`/`dst` query parameter.
pub fn infer_mode(medias: &[Media]) -> Mode {
    let sendable_video = medias
        .iter()
        .any(|m| m.kind == MediaKind::Video && m.direction == Direction::SendOnly);
    if sendable_video {
        return Mode::PassiveConsumer;
    }
    let receivable_video = medias
        .iter()
        .any(|m| m.kind == MediaKind::Video && m.direction == Direction::RecvOnly);
    if receivable_video {
        return Mode::PassiveProducer;
    }
    if medias.iter().any(|m| m.direction == Direction::SendOnly) {
        return Mode::PassiveConsumer;
    }
    Mode::PassiveProducer
}

struct EgressTrack {
    kind: MediaKind,
    local: Arc<TrackLocalStaticRTP>,
    sender: Arc<RTCRtpSender>,
}

/// Immutable identity and metadata captured at creation time.
pub struct ConnectionInfo {
    pub id: u32,
    pub session_id: String,
    pub viewer_id: String,
    pub stream_source: String,
    pub client_ip: String,
    pub user_agent: String,
    pub protocol: SignalProtocol,
    pub mode: Mode,
    pub paused: bool,
}

/// One live peer session. Owns the peer adapter handle, mediates RTP
/// between the stream and the adapter, and carries the pause gate.
pub struct Connection {
    id: u32,
    session_id: String,
    viewer_id: String,
    stream_source: String,
    client_ip: String,
    user_agent: String,
    protocol: SignalProtocol,
    mode: Mode,
    peer: Peer,
    paused: AtomicBool,
    closed: AtomicBool,
    forwarded: AtomicU64,
    keyframe_requests: AtomicU64,
    medias: Mutex<Vec<Media>>,
    egress: Mutex<Vec<EgressTrack>>,
    ingress_ssrcs: Mutex<Vec<u32>>,
    keyframe_request: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Connection {
    pub fn new(info: ConnectionInfo, peer: Peer) -> Arc<Self> {
        Arc::new(Self {
            id: info.id,
            session_id: info.session_id,
            viewer_id: info.viewer_id,
            stream_source: info.stream_source,
            client_ip: info.client_ip,
            user_agent: info.user_agent,
            protocol: info.protocol,
            mode: info.mode,
            peer,
            paused: AtomicBool::new(info.paused),
            closed: AtomicBool::new(false),
            forwarded: AtomicU64::new(0),
            keyframe_requests: AtomicU64::new(0),
            medias: Mutex::new(Vec::new()),
            egress: Mutex::new(Vec::new()),
            ingress_ssrcs: Mutex::new(Vec::new()),
            keyframe_request: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn stream_source(&self) -> &str {
        &self.stream_source
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn protocol(&self) -> SignalProtocol {
        self.protocol
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_consumer(&self) -> bool {
        self.mode == Mode::PassiveConsumer
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn medias(&self) -> Vec<Media> {
        self.medias.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply the remote offer and derive the media list. A consumer also
    /// grows one egress track per sendable media here, before the answer
    /// is created, so the answer covers them.
    pub async fn set_offer(&self, sdp: &str) -> Result<()> {
        self.peer.set_remote_offer(sdp).await?;
        let medias = parse_medias(sdp)?;

        if self.mode == Mode::PassiveConsumer {
            let mut tracks = Vec::new();
            for (i, media) in medias
                .iter()
                .filter(|m| m.direction == Direction::SendOnly)
                .enumerate()
            {
                let id = format!("{}-{i}", media.kind);
                let (local, sender) = self
                    .peer
                    .add_egress_track(media.kind, id, self.stream_source.clone())
                    .await?;
                tracks.push(EgressTrack {
                    kind: media.kind,
                    local,
                    sender,
                });
            }
            *self.egress.lock().unwrap_or_else(|e| e.into_inner()) = tracks;
        }

        *self.medias.lock().unwrap_or_else(|e| e.into_inner()) = medias;
        Ok(())
    }

    pub async fn get_answer(&self) -> Result<String> {
        self.peer.create_local_answer().await
    }

    pub async fn get_complete_answer(&self) -> Result<String> {
        self.peer.complete_local_answer().await
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Suspend egress. Idempotent; tracks stay attached so the remote
    /// freezes on its last decoded frame.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.session_id, "Session paused");
        }
    }

    /// Clear the pause flag and prime the decoder. Keyframes are requested
    /// even when the session was not paused: a caller asking to resume may
    /// be recovering from packet loss.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!(session_id = %self.session_id, "Session resumed");
        }
        self.request_stream_keyframe();
    }

    /// Invoke the keyframe-request hook captured when this consumer joined
    /// its stream.
    pub fn request_stream_keyframe(&self) {
        let hook = self
            .keyframe_request
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(hook) = &*hook {
            hook();
        }
    }

    pub(crate) fn set_keyframe_request(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self
            .keyframe_request
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// The pause gate. Every packet the stream hands this consumer passes
    /// through here; while paused the packet is dropped with no side
    /// effects downstream of the gate.
    pub async fn send_rtp(&self, kind: MediaKind, pkt: &RtpPacket) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        let track = {
            let egress = self.egress.lock().unwrap_or_else(|e| e.into_inner());
            egress
                .iter()
                .find(|t| t.kind == kind)
                .map(|t| Arc::clone(&t.local))
        };
        if let Some(track) = track {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = track.write_rtp(pkt).await {
                trace!(session_id = %self.session_id, "Egress write failed: {e}");
            }
        }
    }

    /// Packets forwarded past the gate since creation.
    pub fn forwarded_packets(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Egress senders, for RTCP feedback wiring.
    pub(crate) fn egress_senders(&self) -> Vec<Arc<RTCRtpSender>> {
        self.egress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|t| Arc::clone(&t.sender))
            .collect()
    }

    /// Remember a video SSRC published by this producer, so keyframe
    /// requests can target it.
    pub(crate) fn record_ingress_ssrc(&self, ssrc: u32) {
        self.ingress_ssrcs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ssrc);
    }

    /// Producer side: ask the remote for a keyframe on every known video
    /// track. The remote may coalesce requests.
    pub async fn request_keyframe_video(&self) {
        let ssrcs = self
            .ingress_ssrcs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for ssrc in ssrcs {
            self.keyframe_requests.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.peer.request_keyframe(ssrc).await {
                debug!(session_id = %self.session_id, ssrc, "Keyframe request failed: {e}");
            }
        }
    }

    /// Keyframe requests issued toward the remote producer.
    pub fn keyframe_request_count(&self) -> u64 {
        self.keyframe_requests.load(Ordering::Relaxed)
    }

    /// First CLOSED transition wins; later ones are no-ops.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub async fn close(&self) {
        if let Err(e) = self.peer.close().await {
            debug!(session_id = %self.session_id, "Peer close: {e}");
        }
    }

    pub fn entry(&self) -> SessionEntry {
        SessionEntry {
            session_id: self.session_id.clone(),
            connection_id: self.id,
            stream_source: self.stream_source.clone(),
            viewer_id: self.viewer_id.clone(),
            client_ip: self.client_ip.clone(),
            mode: self.mode.to_string(),
            paused: self.is_paused(),
        }
    }

    #[cfg(test)]
    pub(crate) async fn add_test_egress(&self, kind: MediaKind) -> Result<()> {
        let (local, sender) = self
            .peer
            .add_egress_track(kind, "test".to_string(), "weir".to_string())
            .await?;
        self.egress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(EgressTrack {
                kind,
                local,
                sender,
            });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_test_medias(&self, medias: Vec<Media>) {
        *self.medias.lock().unwrap_or_else(|e| e.into_inner()) = medias;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{test_connection, test_engine};
    use super::*;
    use bytes::Bytes;

    fn media(kind: MediaKind, direction: Direction) -> Media {
        Media { kind, direction }
    }

    fn test_packet() -> RtpPacket {
        RtpPacket {
            payload: Bytes::from_static(&[0u8; 16]),
            ..Default::default()
        }
    }

    const OFFER_RECVONLY: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=recvonly\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=recvonly\r\n";

    const OFFER_SENDONLY: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=sendonly\r\n\
        m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
        a=sendrecv\r\n";

    #[test]
    fn parse_medias_flips_directions() {
        let medias = parse_medias(OFFER_RECVONLY).expect("parse");
        assert_eq!(medias.len(), 2);
        assert_eq!(medias[0].kind, MediaKind::Video);
        assert_eq!(medias[0].direction, Direction::SendOnly);
        assert_eq!(medias[1].kind, MediaKind::Audio);
        assert_eq!(medias[1].direction, Direction::SendOnly);
    }

    #[test]
    fn parse_medias_skips_datachannel() {
        let medias = parse_medias(OFFER_SENDONLY).expect("parse");
        assert_eq!(medias.len(), 1);
        assert_eq!(medias[0].direction, Direction::RecvOnly);
    }

    #[test]
    fn parse_medias_rejects_garbage() {
        assert!(parse_medias("not sdp at all").is_err());
    }

    #[test]
    fn infer_consumer_from_sendable_video() {
        let medias = [
            media(MediaKind::Audio, Direction::RecvOnly),
            media(MediaKind::Video, Direction::SendOnly),
        ];
        assert_eq!(infer_mode(&medias), Mode::PassiveConsumer);
    }

    #[test]
    fn infer_producer_from_receivable_video() {
        let medias = [media(MediaKind::Video, Direction::RecvOnly)];
        assert_eq!(infer_mode(&medias), Mode::PassiveProducer);
    }

    #[test]
    fn infer_consumer_from_sendable_audio() {
        let medias = [media(MediaKind::Audio, Direction::SendOnly)];
        assert_eq!(infer_mode(&medias), Mode::PassiveConsumer);
    }

    #[test]
    fn infer_producer_when_nothing_sendable() {
        assert_eq!(infer_mode(&[]), Mode::PassiveProducer);
        let medias = [media(MediaKind::Audio, Direction::RecvOnly)];
        assert_eq!(infer_mode(&medias), Mode::PassiveProducer);
    }

    #[tokio::test]
    async fn pause_and_resume_are_idempotent() {
        let engine = test_engine().await;
        let conn = test_connection(&engine, 1, &"a".repeat(32), "", Mode::PassiveConsumer).await;

        assert!(!conn.is_paused());
        conn.pause();
        conn.pause();
        assert!(conn.is_paused());
        conn.resume();
        conn.resume();
        assert!(!conn.is_paused());
        // pause ; resume ; pause == pause
        conn.pause();
        conn.resume();
        conn.pause();
        assert!(conn.is_paused());
        conn.close().await;
    }

    #[tokio::test]
    async fn resume_primes_even_when_not_paused() {
        let engine = test_engine().await;
        let conn = test_connection(&engine, 1, &"b".repeat(32), "", Mode::PassiveConsumer).await;

        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        conn.set_keyframe_request(Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        conn.resume();
        conn.resume();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        conn.close().await;
    }

    #[tokio::test]
    async fn pause_gate_drops_packets() {
        let engine = test_engine().await;
        let conn = test_connection(&engine, 1, &"c".repeat(32), "", Mode::PassiveConsumer).await;
        conn.add_test_egress(MediaKind::Video).await.expect("track");

        let pkt = test_packet();
        conn.pause();
        conn.send_rtp(MediaKind::Video, &pkt).await;
        conn.send_rtp(MediaKind::Video, &pkt).await;
        assert_eq!(conn.forwarded_packets(), 0);

        conn.resume();
        conn.send_rtp(MediaKind::Video, &pkt).await;
        assert_eq!(conn.forwarded_packets(), 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn initially_paused_connection_drops_first_packet() {
        let engine = test_engine().await;
        let peer = engine.new_peer(false, None).await.expect("peer");
        let conn = Connection::new(
            ConnectionInfo {
                id: 7,
                session_id: "d".repeat(32),
                viewer_id: String::new(),
                stream_source: "cam1".to_string(),
                client_ip: "127.0.0.1".to_string(),
                user_agent: "test".to_string(),
                protocol: SignalProtocol::Ws,
                mode: Mode::PassiveConsumer,
                paused: true,
            },
            peer,
        );
        conn.add_test_egress(MediaKind::Video).await.expect("track");

        conn.send_rtp(MediaKind::Video, &test_packet()).await;
        assert_eq!(conn.forwarded_packets(), 0);
        assert!(conn.is_paused());
        conn.close().await;
    }

    #[tokio::test]
    async fn mark_closed_fires_once() {
        let engine = test_engine().await;
        let conn = test_connection(&engine, 1, &"e".repeat(32), "", Mode::PassiveConsumer).await;
        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        conn.close().await;
    }

    #[tokio::test]
    async fn entry_reflects_state() {
        let engine = test_engine().await;
        let conn = test_connection(&engine, 42, &"f".repeat(32), "alice", Mode::PassiveConsumer)
            .await;
        conn.pause();
        let entry = conn.entry();
        assert_eq!(entry.connection_id, 42);
        assert_eq!(entry.session_id, "f".repeat(32));
        assert_eq!(entry.viewer_id, "alice");
        assert_eq!(entry.stream_source, "cam1");
        assert_eq!(entry.mode, "passive consumer");
        assert!(entry.paused);
        conn.close().await;
    }
}
