//! Pull-based capture plumbing and the attendance capture loop.
//!
//! Frames are pulled one at a time, turned into probes by an extractor, and
//! processed strictly in arrival order. Every loop releases its source on
//! exit, whichever way it exits.

use crate::extractor::{ExtractorError, FaceExtractor};
use crate::gallery::GallerySnapshot;
use crate::ledger::{AttendanceLedger, LedgerError, RecordSink};
use crate::types::{MatchResult, Probe};
use image::GrayImage;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("frame source: {0}")]
    Frame(Box<dyn std::error::Error + Send + Sync>),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractorError),
}

/// External stop / cancel signal, checked once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Source of grayscale frames (camera, replay directory, ...).
pub trait FrameSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Block until the next frame is available. `Ok(None)` means the source ended.
    fn next_frame(&mut self) -> Result<Option<GrayImage>, Self::Error>;

    /// Release the underlying device. Must be safe to call more than once.
    fn release(&mut self);
}

/// Source of per-frame probe sets.
pub trait ProbeSource {
    /// Probes for the next frame (possibly empty). `Ok(None)` means the source ended.
    fn next_probes(&mut self) -> Result<Option<Vec<Probe>>, SourceError>;

    /// Release the underlying device. Must be safe to call more than once.
    fn release(&mut self);
}

impl<P: ProbeSource + ?Sized> ProbeSource for Box<P> {
    fn next_probes(&mut self) -> Result<Option<Vec<Probe>>, SourceError> {
        (**self).next_probes()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Turns frames into probes with an extractor.
pub struct ExtractingSource<S, E> {
    frames: S,
    extractor: E,
}

impl<S: FrameSource, E: FaceExtractor> ExtractingSource<S, E> {
    pub fn new(frames: S, extractor: E) -> Self {
        Self { frames, extractor }
    }

    pub fn into_parts(self) -> (S, E) {
        (self.frames, self.extractor)
    }
}

impl<S: FrameSource, E: FaceExtractor> ProbeSource for ExtractingSource<S, E> {
    fn next_probes(&mut self) -> Result<Option<Vec<Probe>>, SourceError> {
        let frame = self
            .frames
            .next_frame()
            .map_err(|e| SourceError::Frame(Box::new(e)))?;
        match frame {
            Some(frame) => Ok(Some(self.extractor.detect(&frame)?)),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.frames.release();
    }
}

/// Releases the wrapped source when dropped.
pub struct SourceGuard<'a, P: ProbeSource + ?Sized> {
    source: &'a mut P,
}

impl<'a, P: ProbeSource + ?Sized> SourceGuard<'a, P> {
    pub fn new(source: &'a mut P) -> Self {
        Self { source }
    }
}

impl<P: ProbeSource + ?Sized> Deref for SourceGuard<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        &*self.source
    }
}

impl<P: ProbeSource + ?Sized> DerefMut for SourceGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        &mut *self.source
    }
}

impl<P: ProbeSource + ?Sized> Drop for SourceGuard<'_, P> {
    fn drop(&mut self) {
        self.source.release();
    }
}

/// What an attendance capture loop did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttendanceSummary {
    pub frames: usize,
    pub probes: usize,
    pub unknown: usize,
    /// Newly recorded and persisted, in marking order.
    pub marked: Vec<String>,
    /// Newly recorded in memory, but the durable write failed.
    pub unpersisted: Vec<String>,
}

/// Run the attendance loop until the source ends or `stop` is signalled.
///
/// The stop signal is checked before every pull. Probes within a frame are
/// classified and marked in order. Persistence failures are logged and
/// counted; the loop keeps running. The source is released on every exit path.
pub fn run_attendance<P, R>(
    source: &mut P,
    gallery: &GallerySnapshot,
    ledger: &mut AttendanceLedger<R>,
    tolerance: f32,
    stop: &CancelToken,
) -> Result<AttendanceSummary, SourceError>
where
    P: ProbeSource + ?Sized,
    R: RecordSink,
{
    let mut source = SourceGuard::new(source);
    let mut summary = AttendanceSummary::default();

    tracing::info!(
        gallery = gallery.size(),
        version = gallery.version(),
        tolerance,
        "attendance capture started"
    );

    loop {
        if stop.is_cancelled() {
            tracing::info!("attendance capture stopped");
            break;
        }
        let Some(probes) = source.next_probes()? else {
            tracing::info!("frame source ended");
            break;
        };
        summary.frames += 1;

        for probe in probes {
            summary.probes += 1;
            match gallery.classify(&probe.embedding, tolerance) {
                MatchResult::Identified {
                    person_id,
                    distance,
                } => {
                    tracing::debug!(
                        person = %person_id,
                        distance,
                        region = ?probe.region,
                        "face identified"
                    );
                    match ledger.mark(&person_id) {
                        Ok(true) => summary.marked.push(person_id),
                        Ok(false) => {}
                        Err(err @ LedgerError::Persistence { .. }) => {
                            tracing::warn!(error = %err, "attendance write failed");
                            summary.unpersisted.push(person_id);
                        }
                        Err(err) => tracing::warn!(error = %err, "attendance not recorded"),
                    }
                }
                MatchResult::Unknown { best_distance } => {
                    tracing::debug!(
                        best_distance = ?best_distance,
                        region = ?probe.region,
                        "unknown face"
                    );
                    summary.unknown += 1;
                }
            }
        }
    }

    tracing::info!(
        frames = summary.frames,
        marked = summary.marked.len(),
        unknown = summary.unknown,
        "attendance capture finished"
    );
    Ok(summary)
}
