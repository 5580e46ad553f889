use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::connection::{Connection, MediaKind};
use crate::engine::RtpPacket;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("no negotiable media in offer")]
    NoMedia,
}

/// Directory of named streams. Names come from the `[streams]` config
/// table; producers publish into them over WebRTC, consumers subscribe.
pub struct StreamHub {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl StreamHub {
    pub fn from_config(streams: &BTreeMap<String, String>) -> Self {
        let map = streams
            .iter()
            .map(|(name, source)| (name.clone(), Stream::new(name.clone(), source.clone())))
            .collect();
        Self {
            streams: RwLock::new(map),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stream>> {
        let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
        streams.get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn create(&self, name: &str) -> Arc<Stream> {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        streams
            .entry(name.to_string())
            .or_insert_with(|| Stream::new(name.to_string(), String::new()))
            .clone()
    }
}

/// One named stream: a set of producer connections feeding a set of
/// consumer connections. The stream owns only the membership lists; each
/// connection owns its peer.
pub struct Stream {
    name: String,
    #[allow(dead_code)]
    source: String,
    inner: Mutex<StreamInner>,
}

struct StreamInner {
    consumers: Vec<Arc<Connection>>,
    producers: Vec<Arc<Connection>>,
}

impl Stream {
    fn new(name: String, source: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            source,
            inner: Mutex::new(StreamInner {
                consumers: Vec::new(),
                producers: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach an egress connection. Captures the keyframe-request hook on
    /// the connection and routes the remote's own RTCP feedback (PLI/FIR)
    /// back to the producers.
    pub fn add_consumer(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<(), StreamError> {
        if conn.medias().is_empty() {
            return Err(StreamError::NoMedia);
        }

        let stream = Arc::downgrade(self);
        conn.set_keyframe_request(Box::new(move || {
            if let Some(stream) = stream.upgrade() {
                tokio::spawn(async move { stream.request_keyframe().await });
            }
        }));

        for sender in conn.egress_senders() {
            let stream = Arc::downgrade(self);
            conn.peer().spawn_rtcp_reader(sender, move || {
                if let Some(stream) = stream.upgrade() {
                    tokio::spawn(async move { stream.request_keyframe().await });
                }
            });
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consumers.push(Arc::clone(conn));
        info!(
            stream = %self.name,
            session_id = %conn.session_id(),
            consumers = inner.consumers.len(),
            "Consumer attached"
        );
        Ok(())
    }

    /// Attach an ingress connection and start fanning its RTP out to the
    /// consumers as tracks arrive.
    pub fn add_producer(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<(), StreamError> {
        if conn.medias().is_empty() {
            return Err(StreamError::NoMedia);
        }

        let stream = Arc::downgrade(self);
        let conn_weak = Arc::downgrade(conn);
        conn.peer().on_remote_track(move |track| {
            let kind = match track.kind() {
                RTPCodecType::Video => MediaKind::Video,
                RTPCodecType::Audio => MediaKind::Audio,
                _ => return,
            };
            if kind == MediaKind::Video
                && let Some(conn) = conn_weak.upgrade()
            {
                conn.record_ingress_ssrc(track.ssrc());
            }
            let stream = stream.clone();
            tokio::spawn(async move {
                while let Ok((pkt, _)) = track.read_rtp().await {
                    let Some(stream) = stream.upgrade() else { break };
                    stream.dispatch(kind, &pkt).await;
                }
                debug!("Producer track ended");
            });
        });

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.producers.push(Arc::clone(conn));
        info!(
            stream = %self.name,
            session_id = %conn.session_id(),
            producers = inner.producers.len(),
            "Producer attached"
        );
        Ok(())
    }

    pub fn remove_consumer(&self, conn: &Connection) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consumers.retain(|c| c.id() != conn.id());
        debug!(stream = %self.name, session_id = %conn.session_id(), "Consumer removed");
    }

    pub fn remove_producer(&self, conn: &Connection) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.producers.retain(|c| c.id() != conn.id());
        debug!(stream = %self.name, session_id = %conn.session_id(), "Producer removed");
    }

    /// Hand one producer packet to every consumer's pause gate.
    pub async fn dispatch(&self, kind: MediaKind, pkt: &RtpPacket) {
        let consumers = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.consumers.clone()
        };
        for conn in consumers {
            conn.send_rtp(kind, pkt).await;
        }
    }

    /// Ask every producer for a keyframe on its video tracks.
    pub async fn request_keyframe(&self) {
        let producers = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.producers.clone()
        };
        for conn in producers {
            conn.request_keyframe_video().await;
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consumers
            .len()
    }

    pub fn producer_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .producers
            .len()
    }
}
