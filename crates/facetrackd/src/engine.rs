use facetrack_core::{
    FaceAnalyzer, FaceTracker, Identity, IdentityEdit, Portrait, PromotionRequest, RenderEntry,
    ScanReport, Track, TrackId, TrackerError, TrackerStatus,
};
use facetrack_hw::{Camera, CameraError, FrameStream};
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("cannot read photo {path}: {source}")]
    Photo {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Where the engine gets frames from. A failed read ends the stream.
pub trait FrameSource {
    fn next_image(&mut self) -> Result<RgbImage, CameraError>;
}

/// V4L2 camera frames, skipping the first few while exposure settles.
pub struct CameraSource {
    stream: FrameStream<'static>,
    warmup_frames: usize,
    _camera: Camera,
}

impl CameraSource {
    pub fn start(camera: Camera, warmup_frames: usize) -> Result<Self, CameraError> {
        Ok(Self {
            stream: camera.stream()?,
            warmup_frames,
            _camera: camera,
        })
    }
}

impl FrameSource for CameraSource {
    fn next_image(&mut self) -> Result<RgbImage, CameraError> {
        if self.warmup_frames > 0 {
            tracing::info!(count = self.warmup_frames, "discarding warmup frames");
            for _ in 0..std::mem::take(&mut self.warmup_frames) {
                let _ = self.stream.next_frame();
            }
        }
        let frame = self.stream.next_frame()?;
        let (width, height, sequence) = (frame.width, frame.height, frame.sequence);
        if frame.is_dark {
            tracing::trace!(seq = sequence, "dark frame");
        }
        frame.into_image().ok_or_else(|| {
            CameraError::CaptureFailed(format!("frame {sequence} is not {width}x{height} RGB"))
        })
    }
}

/// Engine state reported over D-Bus.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub streaming: bool,
    #[serde(flatten)]
    pub tracker: TrackerStatus,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    ListIdentities {
        reply: oneshot::Sender<Vec<Identity>>,
    },
    Identity {
        name: String,
        reply: oneshot::Sender<Option<Identity>>,
    },
    ListTracks {
        reply: oneshot::Sender<Vec<Track>>,
    },
    CurrentFaces {
        reply: oneshot::Sender<Vec<RenderEntry>>,
    },
    Promote {
        track_id: TrackId,
        name: Option<String>,
        description: Option<String>,
        photo: Option<PathBuf>,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
    EditIdentity {
        name: String,
        new_name: Option<String>,
        new_description: Option<String>,
        photo: Option<PathBuf>,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
    DeleteIdentity {
        name: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetTrackDescription {
        track_id: TrackId,
        description: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetDrawLandmarks {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    Rescan {
        reply: oneshot::Sender<ScanReport>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>, EngineError> {
        self.request(|reply| EngineRequest::ListIdentities { reply }).await
    }

    pub async fn identity(&self, name: String) -> Result<Option<Identity>, EngineError> {
        self.request(|reply| EngineRequest::Identity { name, reply }).await
    }

    pub async fn list_tracks(&self) -> Result<Vec<Track>, EngineError> {
        self.request(|reply| EngineRequest::ListTracks { reply }).await
    }

    pub async fn current_faces(&self) -> Result<Vec<RenderEntry>, EngineError> {
        self.request(|reply| EngineRequest::CurrentFaces { reply }).await
    }

    pub async fn promote(
        &self,
        track_id: TrackId,
        name: Option<String>,
        description: Option<String>,
        photo: Option<PathBuf>,
    ) -> Result<Identity, EngineError> {
        self.request(|reply| EngineRequest::Promote {
            track_id,
            name,
            description,
            photo,
            reply,
        })
        .await?
    }

    pub async fn edit_identity(
        &self,
        name: String,
        new_name: Option<String>,
        new_description: Option<String>,
        photo: Option<PathBuf>,
    ) -> Result<Identity, EngineError> {
        self.request(|reply| EngineRequest::EditIdentity {
            name,
            new_name,
            new_description,
            photo,
            reply,
        })
        .await?
    }

    pub async fn delete_identity(&self, name: String) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::DeleteIdentity { name, reply }).await?
    }

    pub async fn set_track_description(&self, track_id: TrackId, description: String) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::SetTrackDescription {
            track_id,
            description,
            reply,
        })
        .await?
    }

    pub async fn set_draw_landmarks(&self, enabled: bool) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::SetDrawLandmarks { enabled, reply }).await
    }

    pub async fn rescan(&self) -> Result<ScanReport, EngineError> {
        self.request(|reply| EngineRequest::Rescan { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    /// Persist the catalog and stop the engine thread.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Shutdown { reply }).await?
    }
}

/// State owned by the engine thread. Frames and control requests are
/// handled one at a time, so no request ever lands inside a frame.
struct Engine {
    tracker: FaceTracker,
    analyzer: Box<dyn FaceAnalyzer>,
    streaming: bool,
}

enum Flow {
    Continue,
    Stop,
}

impl Engine {
    fn process_frame(&mut self, image: &RgbImage) {
        match self.analyzer.analyze(image) {
            Ok(detections) => {
                let faces = self.tracker.reconcile_frame(detections);
                tracing::trace!(faces = faces.len(), "frame processed");
            }
            Err(e) => tracing::warn!(error = %e, "face analysis failed, frame skipped"),
        }
    }

    fn load_portrait(&mut self, path: &Path) -> Result<Portrait, EngineError> {
        let image = image::open(path)
            .map_err(|source| EngineError::Photo {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        Portrait::from_image(self.analyzer.as_mut(), &image).map_err(|e| EngineError::Tracker(e.into()))
    }

    fn promote(
        &mut self,
        track_id: TrackId,
        name: Option<String>,
        description: Option<String>,
        photo: Option<PathBuf>,
    ) -> Result<Identity, EngineError> {
        let portrait = photo.map(|p| self.load_portrait(&p)).transpose()?;
        let request = PromotionRequest {
            name,
            description,
            portrait,
        };
        Ok(self.tracker.promote(track_id, request)?)
    }

    fn edit(
        &mut self,
        name: &str,
        new_name: Option<String>,
        new_description: Option<String>,
        photo: Option<PathBuf>,
    ) -> Result<Identity, EngineError> {
        let portrait = photo.map(|p| self.load_portrait(&p)).transpose()?;
        let edit = IdentityEdit {
            name: new_name,
            description: new_description,
            portrait,
        };
        Ok(self.tracker.edit_identity(name, edit)?)
    }

    fn handle(&mut self, request: EngineRequest) -> Flow {
        match request {
            EngineRequest::ListIdentities { reply } => {
                let _ = reply.send(self.tracker.identities().to_vec());
            }
            EngineRequest::Identity { name, reply } => {
                let _ = reply.send(self.tracker.identity(&name).cloned());
            }
            EngineRequest::ListTracks { reply } => {
                let _ = reply.send(self.tracker.tracks().cloned().collect());
            }
            EngineRequest::CurrentFaces { reply } => {
                let _ = reply.send(self.tracker.current().to_vec());
            }
            EngineRequest::Promote {
                track_id,
                name,
                description,
                photo,
                reply,
            } => {
                let _ = reply.send(self.promote(track_id, name, description, photo));
            }
            EngineRequest::EditIdentity {
                name,
                new_name,
                new_description,
                photo,
                reply,
            } => {
                let _ = reply.send(self.edit(&name, new_name, new_description, photo));
            }
            EngineRequest::DeleteIdentity { name, reply } => {
                let _ = reply.send(self.tracker.delete_identity(&name).map_err(EngineError::from));
            }
            EngineRequest::SetTrackDescription {
                track_id,
                description,
                reply,
            } => {
                let result = self.tracker.set_track_description(track_id, &description);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::SetDrawLandmarks { enabled, reply } => {
                self.tracker.set_draw_landmarks(enabled);
                tracing::info!(enabled, "landmark drawing toggled");
                let _ = reply.send(());
            }
            EngineRequest::Rescan { reply } => {
                let _ = reply.send(self.tracker.rescan(self.analyzer.as_mut()));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(EngineStatus {
                    version: env!("CARGO_PKG_VERSION"),
                    streaming: self.streaming,
                    tracker: self.tracker.status(),
                });
            }
            EngineRequest::Shutdown { reply } => {
                let _ = reply.send(self.tracker.persist().map_err(EngineError::from));
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Serve frames and requests until shutdown. Pending requests are
    /// drained between frames; once the source is exhausted the engine
    /// only waits for requests.
    fn run(mut self, mut source: Option<Box<dyn FrameSource>>, mut rx: mpsc::Receiver<EngineRequest>) {
        loop {
            loop {
                match rx.try_recv() {
                    Ok(request) => {
                        if let Flow::Stop = self.handle(request) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return self.finish(),
                }
            }

            if let Some(active) = source.as_mut() {
                match active.next_image() {
                    Ok(image) => self.process_frame(&image),
                    Err(e) => {
                        tracing::warn!(error = %e, "frame source ended");
                        source = None;
                        self.streaming = false;
                    }
                }
                continue;
            }

            match rx.blocking_recv() {
                Some(request) => {
                    if let Flow::Stop = self.handle(request) {
                        return;
                    }
                }
                None => return self.finish(),
            }
        }
    }

    /// All handles are gone without an explicit shutdown.
    fn finish(self) {
        if let Err(e) = self.tracker.shutdown() {
            tracing::error!(error = %e, "failed to persist catalog");
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// `open_source` runs on the engine thread; if it fails the engine keeps
/// serving control requests without live frames.
pub fn spawn_engine<F>(tracker: FaceTracker, analyzer: Box<dyn FaceAnalyzer>, open_source: F) -> EngineHandle
where
    F: FnOnce() -> Result<Box<dyn FrameSource>, CameraError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facetrack-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let source = match open_source() {
                Ok(source) => Some(source),
                Err(e) => {
                    tracing::error!(error = %e, "no frame source, serving control requests only");
                    None
                }
            };
            let engine = Engine {
                tracker,
                analyzer,
                streaming: source.is_some(),
            };
            engine.run(source, rx);
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}
