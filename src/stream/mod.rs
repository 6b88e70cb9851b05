pub mod processor;
pub mod unit;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtp::packet::Packet;

use crate::codec::{Format, MediaDescription};
use crate::config::StreamConfig;
use processor::FormatProcessor;
use unit::Unit;

/// (media id, payload type): one processor, one subscription key.
pub type SubKey = (usize, u8);

/// Why a reader stopped receiving units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    /// The reader's queue filled up; it was evicted so the writer never
    /// blocks.
    QueueOverflow,
    /// The reader's callback returned an error.
    Callback(String),
}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderError::QueueOverflow => write!(f, "reader queue overflow"),
            ReaderError::Callback(e) => write!(f, "reader callback: {e}"),
        }
    }
}

pub type UnitCallback = Box<dyn FnMut(Unit) -> anyhow::Result<()> + Send>;

/// A reader under construction: callbacks registered per (media, format)
/// before the worker starts.
pub struct StreamSubscription {
    label: String,
    callbacks: HashMap<SubKey, UnitCallback>,
}

impl StreamSubscription {
    pub fn new(label: impl ToString) -> Self {
        Self {
            label: label.to_string(),
            callbacks: HashMap::new(),
        }
    }

    pub fn on_unit(
        &mut self,
        media_id: usize,
        payload_type: u8,
        callback: impl FnMut(Unit) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.callbacks
            .insert((media_id, payload_type), Box::new(callback));
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &SubKey> {
        self.callbacks.keys()
    }
}

/// A started reader. `done()` resolves when the worker exits, carrying the
/// error that stopped it, if any.
pub struct ReaderHandle {
    id: u64,
    label: String,
    error_rx: watch::Receiver<Option<ReaderError>>,
    join: tokio::task::JoinHandle<()>,
}

impl ReaderHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn error(&self) -> Option<ReaderError> {
        self.error_rx.borrow().clone()
    }

    pub async fn done(&mut self) -> Option<ReaderError> {
        // The worker drops its error sender on exit.
        while self.error_rx.changed().await.is_ok() {
            if self.error_rx.borrow().is_some() {
                break;
            }
        }
        self.error_rx.borrow().clone()
    }
}

struct ReaderSlot {
    label: String,
    tx: mpsc::Sender<(SubKey, Unit)>,
    error_tx: watch::Sender<Option<ReaderError>>,
    subscriptions: Vec<SubKey>,
}

struct StreamInner {
    config: StreamConfig,
    medias: Vec<MediaDescription>,
    processors: Mutex<HashMap<SubKey, FormatProcessor>>,
    readers: Mutex<HashMap<u64, ReaderSlot>>,
    next_reader_id: AtomicU64,
}

/// Fan-out hub between one RTP ingest task and any number of readers.
///
/// The writer side is non-blocking: each reader owns a bounded queue and a
/// worker task, and a reader that cannot keep up is evicted rather than
/// ever back-pressuring ingest. Units for one (media, format) reach one
/// reader in emission order; nothing is guaranteed across media or across
/// readers.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub fn new(config: StreamConfig, medias: Vec<MediaDescription>) -> Self {
        let mut processors = HashMap::new();
        for media in &medias {
            for format in &media.formats {
                processors.insert(
                    (media.id, format.payload_type()),
                    FormatProcessor::new(media.id, format, &config.ntp_sources),
                );
            }
        }
        Self {
            inner: Arc::new(StreamInner {
                config,
                medias,
                processors: Mutex::new(processors),
                readers: Mutex::new(HashMap::new()),
                next_reader_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn medias(&self) -> &[MediaDescription] {
        &self.inner.medias
    }

    pub fn format(&self, media_id: usize, payload_type: u8) -> Option<Format> {
        self.inner
            .medias
            .iter()
            .find(|m| m.id == media_id)
            .and_then(|m| {
                m.formats
                    .iter()
                    .find(|f| f.payload_type() == payload_type)
                    .cloned()
            })
    }

    pub fn reader_count(&self) -> usize {
        self.inner.readers.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Ingest one RTP packet. Called from the single writer task; never
    /// blocks on readers.
    pub fn write_rtp_packet(
        &self,
        media_id: usize,
        payload_type: u8,
        pkt: Packet,
        now: DateTime<Utc>,
        pts_hint: Option<i64>,
    ) {
        let key = (media_id, payload_type);
        let units = {
            let mut processors = match self.inner.processors.lock() {
                Ok(p) => p,
                Err(_) => return,
            };
            match processors.get_mut(&key) {
                Some(p) => p.process_rtp(pkt, now, pts_hint),
                None => {
                    debug!(
                        "[stream] packet for unknown media {} pt {}",
                        media_id, payload_type
                    );
                    return;
                }
            }
        };

        for unit in units {
            self.dispatch(key, unit);
        }
    }

    /// Ingest one RTCP Sender Report for a track. Called from the track's
    /// RTCP co-task; only the newest report is retained.
    pub fn write_rtcp_sender_report(&self, media_id: usize, payload_type: u8, sr: &SenderReport) {
        if let Ok(processors) = self.inner.processors.lock() {
            if let Some(p) = processors.get(&(media_id, payload_type)) {
                p.rtcp().handle_sender_report(sr);
            }
        }
    }

    fn dispatch(&self, key: SubKey, unit: Unit) {
        let mut evicted = Vec::new();
        {
            let mut readers = match self.inner.readers.lock() {
                Ok(r) => r,
                Err(_) => return,
            };
            let ids: Vec<u64> = readers
                .iter()
                .filter(|(_, slot)| slot.subscriptions.contains(&key))
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                let slot = readers.get(id).expect("reader present");
                match slot.tx.try_send((key, unit.clone())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let slot = readers.remove(id).expect("reader present");
                        let _ = slot.error_tx.send(Some(ReaderError::QueueOverflow));
                        evicted.push(slot.label);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        readers.remove(id);
                    }
                }
            }
        }
        for label in evicted {
            warn!("[stream] reader {} evicted: queue overflow", label);
        }
    }

    /// Start a reader: its worker dequeues units and invokes the
    /// registered callbacks until the stream closes, the reader is evicted
    /// or a callback fails.
    pub fn start_reader(&self, subscription: StreamSubscription) -> ReaderHandle {
        let StreamSubscription {
            label,
            mut callbacks,
        } = subscription;
        let id = self.inner.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<(SubKey, Unit)>(self.inner.config.write_queue_size);
        let (error_tx, error_rx) = watch::channel(None);

        {
            let slot = ReaderSlot {
                label: label.clone(),
                tx,
                error_tx: error_tx.clone(),
                subscriptions: callbacks.keys().copied().collect(),
            };
            if let Ok(mut readers) = self.inner.readers.lock() {
                readers.insert(id, slot);
            }
        }
        info!("[stream] reader {} started", label);

        let inner = self.inner.clone();
        let worker_label = label.clone();
        let join = tokio::spawn(async move {
            while let Some((key, unit)) = rx.recv().await {
                let Some(cb) = callbacks.get_mut(&key) else {
                    continue;
                };
                if let Err(e) = cb(unit) {
                    warn!("[stream] reader {} stopped: {}", worker_label, e);
                    let _ = error_tx.send(Some(ReaderError::Callback(e.to_string())));
                    if let Ok(mut readers) = inner.readers.lock() {
                        readers.remove(&id);
                    }
                    return;
                }
            }
            // Channel closed: either eviction (error already set) or an
            // orderly stop.
            debug!("[stream] reader {} finished", worker_label);
        });

        ReaderHandle {
            id,
            label,
            error_rx,
            join,
        }
    }

    /// Detach a reader and wait for its worker to drain and exit.
    pub async fn stop_reader(&self, handle: ReaderHandle) {
        if let Ok(mut readers) = self.inner.readers.lock() {
            readers.remove(&handle.id);
        }
        let _ = handle.join.await;
        debug!("[stream] reader {} stopped", handle.label);
    }

    /// Drop every reader. Their workers finish draining their queues.
    pub async fn close(&self) {
        let slots: Vec<ReaderSlot> = match self.inner.readers.lock() {
            Ok(mut readers) => readers.drain().map(|(_, s)| s).collect(),
            Err(_) => return,
        };
        drop(slots);
        info!("[stream] closed");
    }
}
