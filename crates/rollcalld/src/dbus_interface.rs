use crate::engine::{EngineError, EngineHandle};
use rollcall_core::{GalleryError, RosterError, SessionError, VerificationOutcome};
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use zbus::interface;
use zbus::message::Header;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// Who last passed admin verification, over which bus connection, and when.
///
/// The grant belongs to the unique bus name that ran the verification; other
/// clients on the same bus do not inherit it.
#[derive(Debug)]
pub struct AdminGrant {
    window: Duration,
    granted: Option<Granted>,
}

#[derive(Debug)]
struct Granted {
    person_id: String,
    sender: String,
    at: Instant,
}

impl AdminGrant {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            granted: None,
        }
    }

    pub fn grant(&mut self, person_id: &str, sender: &str, now: Instant) {
        self.granted = Some(Granted {
            person_id: person_id.to_string(),
            sender: sender.to_string(),
            at: now,
        });
    }

    /// The admin whose grant `sender` still holds at `now`, if any.
    pub fn holder(&self, sender: &str, now: Instant) -> Option<&str> {
        match &self.granted {
            Some(g) if g.sender == sender && now.saturating_duration_since(g.at) <= self.window => {
                Some(&g.person_id)
            }
            _ => None,
        }
    }

    /// Drop the grant if `sender` holds it. Returns whether a valid grant was dropped.
    pub fn revoke(&mut self, sender: &str, now: Instant) -> bool {
        let held = self.holder(sender, now).is_some();
        if self.granted.as_ref().is_some_and(|g| g.sender == sender) {
            self.granted = None;
        }
        held
    }
}

/// D-Bus interface for the rollcall daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    engine: EngineHandle,
    grant: Mutex<AdminGrant>,
}

impl RollcallService {
    pub fn new(engine: EngineHandle, admin_grant: Duration) -> Self {
        Self {
            engine,
            grant: Mutex::new(AdminGrant::new(admin_grant)),
        }
    }

    fn lock_grant(&self) -> std::sync::MutexGuard<'_, AdminGrant> {
        self.grant.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The admin whose grant the calling connection holds, if any.
    fn grant_holder(&self, hdr: &Header<'_>) -> Option<String> {
        let sender = caller(hdr)?;
        self.lock_grant()
            .holder(&sender, Instant::now())
            .map(str::to_string)
    }

    fn require_admin(&self, hdr: &Header<'_>, method: &str) -> zbus::fdo::Result<String> {
        match self.grant_holder(hdr) {
            Some(admin) => {
                tracing::info!(admin = %admin, method, "admin operation authorized");
                Ok(admin)
            }
            None => {
                tracing::warn!(method, "admin operation refused: no valid verification");
                Err(admin_required())
            }
        }
    }
}

/// Unique bus name of the client that sent the message.
fn caller(hdr: &Header<'_>) -> Option<String> {
    hdr.sender().map(|name| name.to_string())
}

fn admin_required() -> zbus::fdo::Error {
    zbus::fdo::Error::AccessDenied("admin verification required (run `rollcall admin`)".into())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %err, "request failed");
    match &err {
        EngineError::Roster(RosterError::NotEnrolled(_))
        | EngineError::Gallery(GalleryError::InvalidPersonId(_)) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        EngineError::Session(SessionError::NoRoster | SessionError::NoPrivilegedIdentities) => {
            zbus::fdo::Error::AccessDenied(err.to_string())
        }
        EngineError::RosterNotEmpty => admin_required(),
        EngineError::Busy => zbus::fdo::Error::LimitsExceeded(err.to_string()),
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Start the attendance capture loop.
    async fn run(&self) -> zbus::fdo::Result<()> {
        tracing::info!("attendance run requested");
        self.engine.start_attendance().await.map_err(to_fdo)
    }

    /// Stop the attendance loop, or cancel an in-flight verification.
    /// Returns the attendance summary as JSON, or `null` if only a verification was cancelled.
    async fn stop(&self) -> zbus::fdo::Result<String> {
        let cancelled = self.engine.cancel_verification();
        match self.engine.stop_attendance().await {
            Ok(summary) => to_json(&summary),
            Err(EngineError::NotRunning) if cancelled => Ok("null".into()),
            Err(err) => Err(to_fdo(err)),
        }
    }

    /// Run the timed admin challenge. On success the calling connection holds
    /// the admin grant for the configured window.
    async fn verify_admin(&self, #[zbus(header)] hdr: Header<'_>) -> zbus::fdo::Result<String> {
        let outcome = self.engine.verify_admin().await.map_err(to_fdo)?;
        if let VerificationOutcome::Verified { person_id } = &outcome {
            match caller(&hdr) {
                Some(sender) => self.lock_grant().grant(person_id, &sender, Instant::now()),
                None => tracing::warn!(person = %person_id, "verified caller has no bus name"),
            }
        }
        to_json(&outcome)
    }

    /// Give up the caller's admin grant early.
    async fn drop_admin(&self, #[zbus(header)] hdr: Header<'_>) -> bool {
        match caller(&hdr) {
            Some(sender) => self.lock_grant().revoke(&sender, Instant::now()),
            None => false,
        }
    }

    async fn list_admins(&self) -> zbus::fdo::Result<String> {
        let roster = self.engine.roster_list().await.map_err(to_fdo)?;
        to_json(&roster)
    }

    /// Grant a person admin rights. Ungated while the roster is empty.
    async fn add_admin(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        person_id: &str,
    ) -> zbus::fdo::Result<bool> {
        match self.grant_holder(&hdr) {
            Some(admin) => {
                tracing::info!(admin = %admin, method = "AddAdmin", "admin operation authorized");
                self.engine.roster_add(person_id).await.map_err(to_fdo)
            }
            None => self.engine.roster_bootstrap(person_id).await.map_err(to_fdo),
        }
    }

    async fn remove_admin(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        person_id: &str,
    ) -> zbus::fdo::Result<bool> {
        self.require_admin(&hdr, "RemoveAdmin")?;
        self.engine.roster_remove(person_id).await.map_err(to_fdo)
    }

    /// Every attendance record on disk, as JSON.
    async fn report(&self, #[zbus(header)] hdr: Header<'_>) -> zbus::fdo::Result<String> {
        self.require_admin(&hdr, "Report")?;
        let records = self.engine.report().await.map_err(to_fdo)?;
        to_json(&records)
    }

    async fn enroll(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        person_id: &str,
    ) -> zbus::fdo::Result<String> {
        self.require_admin(&hdr, "Enroll")?;
        let report = self.engine.enroll(person_id).await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Returns the number of embeddings removed.
    async fn revoke(
        &self,
        #[zbus(header)] hdr: Header<'_>,
        person_id: &str,
    ) -> zbus::fdo::Result<u32> {
        self.require_admin(&hdr, "Revoke")?;
        let removed = self.engine.revoke(person_id).await.map_err(to_fdo)?;
        Ok(removed as u32)
    }

    async fn persons(&self) -> zbus::fdo::Result<String> {
        let persons = self.engine.persons().await.map_err(to_fdo)?;
        to_json(&persons)
    }

    async fn reload(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.reload_gallery().await.map_err(to_fdo)?;
        to_json(&status)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        if self.engine.attendance_running() {
            return Ok(serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "attendance": "running",
            })
            .to_string());
        }
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}
