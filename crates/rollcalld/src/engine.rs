use crate::config::Config;
use rollcall_core::{
    run_attendance, AttendanceLedger, AttendanceLog, AttendanceRecord, AttendanceSummary,
    CancelToken, Clock, EnrollReport, Enrollment, ExtractingSource, FaceExtractor, Gallery,
    GalleryError, LedgerError, ProbeSource, RosterError, RosterStore, SessionError, SourceError,
    SystemClock, VerificationOutcome, VerificationSession,
};
use rollcall_hw::{Camera, ReplaySource};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("attendance log: {0}")]
    Ledger(#[from] LedgerError),
    #[error("roster: {0}")]
    Roster(#[from] RosterError),
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("capture: {0}")]
    Source(#[from] SourceError),
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("an attendance capture is already running")]
    Busy,
    #[error("no attendance capture is running")]
    NotRunning,
    #[error("the admin roster is not empty; admin verification required")]
    RosterNotEmpty,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of engine state for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub gallery_version: u64,
    pub embeddings: usize,
    pub persons: usize,
    pub dimension: Option<usize>,
    pub marked: Vec<String>,
    pub tolerance: f32,
    pub frame_source: String,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    ReloadGallery { reply: Reply<EngineStatus> },
    Enroll { person_id: String, reply: Reply<EnrollReport> },
    Revoke { person_id: String, reply: Reply<usize> },
    Persons { reply: Reply<Vec<String>> },
    RunAttendance {
        stop: CancelToken,
        finished: Arc<AtomicBool>,
        started: Reply<()>,
        reply: Reply<AttendanceSummary>,
    },
    VerifyAdmin { cancel: CancelToken, reply: Reply<VerificationOutcome> },
    RosterList { reply: Reply<Vec<String>> },
    RosterAdd { person_id: String, reply: Reply<bool> },
    RosterBootstrap { person_id: String, reply: Reply<bool> },
    RosterRemove { person_id: String, reply: Reply<bool> },
    Report { reply: Reply<Vec<AttendanceRecord>> },
    Status { reply: Reply<EngineStatus> },
}

/// An attendance loop handed to the engine thread. `finished` flips once the
/// loop returns; the summary waits in `summary` until someone stops the run.
struct AttendanceRun {
    stop: CancelToken,
    finished: Arc<AtomicBool>,
    summary: oneshot::Receiver<Result<AttendanceSummary, EngineError>>,
}

impl AttendanceRun {
    fn is_running(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }
}

/// In-flight capture loop, tracked outside the engine thread so it can be
/// stopped while the engine is busy running it.
#[derive(Default)]
struct ActiveCapture {
    attendance: Option<AttendanceRun>,
    verification: Option<CancelToken>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    active: Arc<Mutex<ActiveCapture>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        if self.attendance_running() {
            return Err(EngineError::Busy);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// True while the engine thread is inside the attendance loop.
    pub fn attendance_running(&self) -> bool {
        self.lock_active()
            .attendance
            .as_ref()
            .is_some_and(AttendanceRun::is_running)
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, ActiveCapture> {
        // A poisoned lock only means a handler panicked mid-update; the state is still usable.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rebuild the gallery from the dataset directory.
    pub async fn reload_gallery(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::ReloadGallery { reply }).await
    }

    /// Re-extract one person's enrollment images.
    pub async fn enroll(&self, person_id: &str) -> Result<EnrollReport, EngineError> {
        let person_id = person_id.to_string();
        self.request(|reply| EngineRequest::Enroll { person_id, reply }).await
    }

    /// Drop a person from the in-memory gallery.
    pub async fn revoke(&self, person_id: &str) -> Result<usize, EngineError> {
        let person_id = person_id.to_string();
        self.request(|reply| EngineRequest::Revoke { person_id, reply }).await
    }

    pub async fn persons(&self) -> Result<Vec<String>, EngineError> {
        self.request(|reply| EngineRequest::Persons { reply }).await
    }

    /// Start the attendance capture loop. Returns once the frame source is
    /// open, or with the error that kept it from opening.
    /// [`stop_attendance`](Self::stop_attendance) ends the run and yields the summary.
    pub async fn start_attendance(&self) -> Result<(), EngineError> {
        let stop = CancelToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut active = self.lock_active();
            if let Some(run) = &active.attendance {
                if run.is_running() {
                    return Err(EngineError::Busy);
                }
                tracing::info!("discarding uncollected summary of a finished attendance run");
            }
            active.attendance = Some(AttendanceRun {
                stop: stop.clone(),
                finished: finished.clone(),
                summary: reply_rx,
            });
        }

        let sent = self
            .tx
            .send(EngineRequest::RunAttendance {
                stop,
                finished: finished.clone(),
                started: started_tx,
                reply: reply_tx,
            })
            .await;
        let result = match sent {
            Err(_) => Err(EngineError::ChannelClosed),
            Ok(()) => started_rx.await.unwrap_or(Err(EngineError::ChannelClosed)),
        };
        if result.is_err() {
            self.clear_attendance(&finished);
        }
        result
    }

    /// Forget the run identified by `finished`, unless another run replaced it.
    fn clear_attendance(&self, finished: &Arc<AtomicBool>) {
        let mut active = self.lock_active();
        if active
            .attendance
            .as_ref()
            .is_some_and(|run| Arc::ptr_eq(&run.finished, finished))
        {
            active.attendance = None;
        }
    }

    /// Signal the attendance loop to stop and wait for its summary. Also
    /// collects the summary of a run whose source has already ended.
    pub async fn stop_attendance(&self) -> Result<AttendanceSummary, EngineError> {
        let run = self
            .lock_active()
            .attendance
            .take()
            .ok_or(EngineError::NotRunning)?;
        run.stop.cancel();
        run.summary.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run an admin verification session against a fresh read of the roster.
    pub async fn verify_admin(&self) -> Result<VerificationOutcome, EngineError> {
        let cancel = CancelToken::new();
        {
            let mut active = self.lock_active();
            if active.verification.is_some() {
                return Err(EngineError::Busy);
            }
            active.verification = Some(cancel.clone());
        }
        let result = self
            .request(|reply| EngineRequest::VerifyAdmin { cancel, reply })
            .await;
        self.lock_active().verification = None;
        result
    }

    /// Cancel an in-flight admin verification. Returns false if none was running.
    pub fn cancel_verification(&self) -> bool {
        match &self.lock_active().verification {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn roster_list(&self) -> Result<Vec<String>, EngineError> {
        self.request(|reply| EngineRequest::RosterList { reply }).await
    }

    pub async fn roster_add(&self, person_id: &str) -> Result<bool, EngineError> {
        let person_id = person_id.to_string();
        self.request(|reply| EngineRequest::RosterAdd { person_id, reply }).await
    }

    /// Add the first administrator. Fails with
    /// [`RosterNotEmpty`](EngineError::RosterNotEmpty) once anyone is on the roster.
    pub async fn roster_bootstrap(&self, person_id: &str) -> Result<bool, EngineError> {
        let person_id = person_id.to_string();
        self.request(|reply| EngineRequest::RosterBootstrap { person_id, reply }).await
    }

    pub async fn roster_remove(&self, person_id: &str) -> Result<bool, EngineError> {
        let person_id = person_id.to_string();
        self.request(|reply| EngineRequest::RosterRemove { person_id, reply }).await
    }

    pub async fn report(&self) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.request(|reply| EngineRequest::Report { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// State owned by the engine thread. Every mutation of the gallery, ledger and
/// roster happens here, one request at a time.
struct Engine<E> {
    config: Config,
    gallery: Gallery,
    ledger: AttendanceLedger,
    roster: RosterStore,
    extractor: E,
    clock: Arc<dyn Clock>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the gallery synchronously so startup fails fast on a broken dataset
/// or extractor. The frame source is opened per capture loop, not here.
pub fn spawn_engine<E>(config: Config, mut extractor: E) -> Result<EngineHandle, EngineError>
where
    E: FaceExtractor + Send + 'static,
{
    let gallery = Gallery::load_dir(&config.dataset_dir, &mut extractor)?;
    let ledger = AttendanceLedger::open(&config.attendance_path, config.reset_policy);
    let roster = RosterStore::new(&config.roster_path);

    let mut engine = Engine {
        config,
        gallery,
        ledger,
        roster,
        extractor,
        clock: Arc::new(SystemClock),
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        active: Arc::new(Mutex::new(ActiveCapture::default())),
    })
}

impl<E: FaceExtractor> Engine<E> {
    fn handle(&mut self, req: EngineRequest) {
        // Replies are dropped silently if the requester went away.
        match req {
            EngineRequest::ReloadGallery { reply } => {
                let _ = reply.send(self.reload_gallery());
            }
            EngineRequest::Enroll { person_id, reply } => {
                let _ = reply.send(self.enroll(&person_id));
            }
            EngineRequest::Revoke { person_id, reply } => {
                let _ = reply.send(Ok(self.gallery.revoke(&person_id)));
            }
            EngineRequest::Persons { reply } => {
                let _ = reply.send(Ok(self.gallery.snapshot().persons().to_vec()));
            }
            EngineRequest::RunAttendance {
                stop,
                finished,
                started,
                reply,
            } => {
                let result = self.run_attendance(&stop, started);
                finished.store(true, Ordering::SeqCst);
                let _ = reply.send(result);
            }
            EngineRequest::VerifyAdmin { cancel, reply } => {
                let _ = reply.send(self.verify_admin(&cancel));
            }
            EngineRequest::RosterList { reply } => {
                let _ = reply.send(self.roster.list().map_err(EngineError::from));
            }
            EngineRequest::RosterAdd { person_id, reply } => {
                let snapshot = self.gallery.snapshot();
                let added = self.roster.add(&person_id, &snapshot);
                let _ = reply.send(added.map_err(EngineError::from));
            }
            EngineRequest::RosterBootstrap { person_id, reply } => {
                let _ = reply.send(self.bootstrap_roster(&person_id));
            }
            EngineRequest::RosterRemove { person_id, reply } => {
                let _ = reply.send(self.roster.remove(&person_id).map_err(EngineError::from));
            }
            EngineRequest::Report { reply } => {
                let _ = reply.send(
                    AttendanceLog::read(&self.config.attendance_path).map_err(EngineError::from),
                );
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
        }
    }

    fn reload_gallery(&mut self) -> Result<EngineStatus, EngineError> {
        self.gallery = Gallery::load_dir(&self.config.dataset_dir, &mut self.extractor)?;
        Ok(self.status())
    }

    fn enroll(&mut self, person_id: &str) -> Result<EnrollReport, EngineError> {
        let dir = self.config.dataset_dir.join(person_id);
        let enrollment = Enrollment::from_dir(person_id, &dir)?;
        Ok(self.gallery.enroll(&enrollment, &mut self.extractor)?)
    }

    /// Open the source, report that on `started`, then loop until stopped or
    /// the source ends. An open failure goes to `started` only.
    fn run_attendance(
        &mut self,
        stop: &CancelToken,
        started: Reply<()>,
    ) -> Result<AttendanceSummary, EngineError> {
        let snapshot = self.gallery.snapshot();
        let mut source = match open_source(&self.config, &mut self.extractor) {
            Ok(source) => source,
            Err(err) => {
                tracing::warn!(error = %err, "attendance run could not start");
                let _ = started.send(Err(err));
                return Err(EngineError::NotRunning);
            }
        };
        let _ = started.send(Ok(()));
        Ok(run_attendance(
            &mut *source,
            &snapshot,
            &mut self.ledger,
            self.config.tolerance,
            stop,
        )?)
    }

    /// Roster emptiness is checked and the add made in the same request, so
    /// two callers cannot both bootstrap.
    fn bootstrap_roster(&mut self, person_id: &str) -> Result<bool, EngineError> {
        if !self.roster.list()?.is_empty() {
            return Err(EngineError::RosterNotEmpty);
        }
        let added = self.roster.add(person_id, &self.gallery.snapshot())?;
        tracing::info!(person = person_id, "bootstrapped first administrator");
        Ok(added)
    }

    fn verify_admin(&mut self, cancel: &CancelToken) -> Result<VerificationOutcome, EngineError> {
        // Re-read on every session so revocations apply immediately.
        let roster = self.roster.list()?;
        let mut session = VerificationSession::new(
            &self.gallery.snapshot(),
            roster,
            self.config.tolerance,
            Duration::from_secs(self.config.verify_timeout_secs),
            self.clock.clone(),
        );
        // Configuration errors surface before the camera is touched.
        session.start()?;

        let mut source = open_source(&self.config, &mut self.extractor)?;
        Ok(session.run(&mut *source, cancel)?)
    }

    fn status(&self) -> EngineStatus {
        let snapshot = self.gallery.snapshot();
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            gallery_version: snapshot.version(),
            embeddings: snapshot.size(),
            persons: snapshot.persons().len(),
            dimension: snapshot.dimension(),
            marked: self.ledger.marked(),
            tolerance: self.config.tolerance,
            frame_source: match &self.config.frames_dir {
                Some(dir) => format!("replay:{}", dir.display()),
                None => self.config.camera_device.clone(),
            },
        }
    }
}

/// Open the configured frame source and attach the extractor.
fn open_source<'a, E: FaceExtractor>(
    config: &Config,
    extractor: &'a mut E,
) -> Result<Box<dyn ProbeSource + 'a>, EngineError> {
    match &config.frames_dir {
        Some(dir) => {
            let frames = ReplaySource::from_dir(dir)
                .map_err(|e| EngineError::SourceUnavailable(e.to_string()))?;
            Ok(Box::new(ExtractingSource::new(frames, extractor)))
        }
        None => {
            let mut camera = Camera::open(&config.camera_device)
                .map_err(|e| EngineError::SourceUnavailable(e.to_string()))?;
            camera.warm_up(config.warmup_frames);
            Ok(Box::new(ExtractingSource::new(camera, extractor)))
        }
    }
}
