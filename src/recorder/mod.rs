mod instance;
pub mod path;
pub mod segment;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RecorderConfig;
use crate::stream::{ReaderHandle, Stream, StreamSubscription};

use instance::{RecorderCore, TrackSpec};

pub type OnSegmentCreate = Arc<dyn Fn(&Path) + Send + Sync>;
pub type OnSegmentComplete = Arc<dyn Fn(&Path, Duration) + Send + Sync>;

/// Records a stream to disk as a sequence of segment files.
///
/// `initialize` validates the configuration and spawns a supervisor; the
/// supervisor subscribes a recorder instance to the stream and re-creates
/// it after a cooldown whenever it dies (reader eviction, callback
/// failure, write error). Files produced before and after a restart are
/// independent; there is no stitching.
pub struct Recorder {
    stream: Stream,
    config: RecorderConfig,
    path_name: String,
    pub on_segment_create: Option<OnSegmentCreate>,
    pub on_segment_complete: Option<OnSegmentComplete>,

    terminate: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Recorder {
    pub fn new(stream: Stream, config: RecorderConfig, path_name: impl ToString) -> Self {
        Self {
            stream,
            config,
            path_name: path_name.to_string(),
            on_segment_create: None,
            on_segment_complete: None,
            terminate: None,
            supervisor: None,
        }
    }

    fn recordable_tracks(&self) -> Vec<TrackSpec> {
        let mut specs = Vec::new();
        for media in self.stream.medias() {
            for format in &media.formats {
                if !format.is_recordable() {
                    warn!(
                        "[recorder] {} skipping unsupported codec {}",
                        self.path_name,
                        format.name()
                    );
                    continue;
                }
                if self.config.video_only
                    && format.kind() != crate::codec::MediaKind::Video
                {
                    continue;
                }
                specs.push(TrackSpec {
                    media_id: media.id,
                    payload_type: format.payload_type(),
                    format: format.clone(),
                });
            }
        }
        specs
    }

    /// Validate and start recording. Fails without side effects when the
    /// configuration is unusable or no track can be recorded.
    pub fn initialize(&mut self) -> Result<()> {
        if self.terminate.is_some() {
            bail!("already initialized");
        }
        self.config.validate()?;
        let specs = self.recordable_tracks();
        if specs.is_empty() {
            bail!("no recordable tracks in stream");
        }
        let ctx = SupervisorContext {
            stream: self.stream.clone(),
            config: self.config.clone(),
            path_name: self.path_name.clone(),
            specs,
            on_segment_create: self.on_segment_create.clone(),
            on_segment_complete: self.on_segment_complete.clone(),
        };
        // The first instance subscribes before this returns, so packets
        // written right away are not missed.
        let first = spawn_instance(&ctx)?;

        let (terminate_tx, terminate_rx) = watch::channel(false);
        self.terminate = Some(terminate_tx);
        self.supervisor = Some(tokio::spawn(run_supervisor(ctx, terminate_rx, first)));
        info!("[recorder] {} started", self.path_name);
        Ok(())
    }

    /// Stop recording: the current segment is flushed and closed before
    /// this returns.
    pub async fn close(&mut self) {
        if let Some(terminate) = self.terminate.take() {
            let _ = terminate.send(true);
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.await;
        }
        info!("[recorder] {} stopped", self.path_name);
    }
}

struct SupervisorContext {
    stream: Stream,
    config: RecorderConfig,
    path_name: String,
    specs: Vec<TrackSpec>,
    on_segment_create: Option<OnSegmentCreate>,
    on_segment_complete: Option<OnSegmentComplete>,
}

async fn run_supervisor(
    ctx: SupervisorContext,
    mut terminate: watch::Receiver<bool>,
    first: (Arc<Mutex<RecorderCore>>, ReaderHandle),
) {
    let mut current = Some(first);
    loop {
        let (core, mut reader) = match current.take() {
            Some(v) => v,
            None => match spawn_instance(&ctx) {
                Ok(v) => v,
                Err(e) => {
                    warn!("[recorder] {} instance creation failed: {}", ctx.path_name, e);
                    tokio::select! {
                        _ = tokio::time::sleep(ctx.config.restart_pause()) => continue,
                        _ = terminate.changed() => return,
                    }
                }
            },
        };

        tokio::select! {
            err = reader.done() => {
                warn!(
                    "[recorder] {} instance terminated ({}), restarting in {:?}",
                    ctx.path_name,
                    err.map(|e| e.to_string()).unwrap_or_else(|| "closed".into()),
                    ctx.config.restart_pause(),
                );
                finalize_core(&ctx, &core);
                tokio::select! {
                    _ = tokio::time::sleep(ctx.config.restart_pause()) => {}
                    _ = terminate.changed() => return,
                }
            }
            _ = terminate.changed() => {
                // Drain the reader queue before flushing so nothing
                // already ingested is lost.
                ctx.stream.stop_reader(reader).await;
                finalize_core(&ctx, &core);
                return;
            }
        }
    }
}

fn finalize_core(ctx: &SupervisorContext, core: &Arc<Mutex<RecorderCore>>) {
    if let Ok(mut core) = core.lock() {
        if let Err(e) = core.finalize() {
            warn!("[recorder] {} finalize failed: {}", ctx.path_name, e);
        }
    }
}

fn spawn_instance(
    ctx: &SupervisorContext,
) -> Result<(Arc<Mutex<RecorderCore>>, ReaderHandle)> {
    let core = Arc::new(Mutex::new(RecorderCore::new(
        ctx.config.clone(),
        ctx.path_name.clone(),
        ctx.specs.clone(),
        ctx.on_segment_create.clone(),
        ctx.on_segment_complete.clone(),
    )?));

    let mut subscription = StreamSubscription::new(format!("recorder:{}", ctx.path_name));
    let keys = core.lock().expect("fresh core").track_keys();
    for (idx, (media_id, payload_type)) in keys.into_iter().enumerate() {
        let core = core.clone();
        subscription.on_unit(media_id, payload_type, move |unit| {
            let mut core = core.lock().map_err(|_| anyhow::anyhow!("recorder poisoned"))?;
            core.on_unit(idx, unit)
        });
    }

    let reader = ctx.stream.start_reader(subscription);
    Ok((core, reader))
}
