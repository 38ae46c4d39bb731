use anyhow::Context;
use rollcall_core::ResetPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration.
///
/// Defaults, then an optional TOML file named by `ROLLCALL_CONFIG`, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// One subdirectory of enrollment images per person.
    pub dataset_dir: PathBuf,
    /// Append-only attendance records.
    pub attendance_path: PathBuf,
    /// Admin roster, one person id per line.
    pub roster_path: PathBuf,
    /// V4L2 device path.
    pub camera_device: String,
    /// Replay frames from this directory instead of the camera.
    pub frames_dir: Option<PathBuf>,
    /// Maximum Euclidean distance for a positive match (attendance and admin alike).
    pub tolerance: f32,
    /// Deadline for an admin verification session.
    pub verify_timeout_secs: u64,
    /// Frames discarded after opening the camera (auto-exposure settling).
    pub warmup_frames: usize,
    /// How long a successful admin verification unlocks admin operations.
    pub admin_grant_secs: u64,
    /// When the attendance de-duplication set is cleared.
    pub reset_policy: ResetPolicy,
    /// Extractor helper command line; receives PNG on stdin, prints JSON probes.
    pub extractor: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset"),
            attendance_path: PathBuf::from("attendance.csv"),
            roster_path: PathBuf::from("admins.txt"),
            camera_device: "/dev/video0".to_string(),
            frames_dir: None,
            tolerance: rollcall_core::DEFAULT_TOLERANCE,
            verify_timeout_secs: 10,
            warmup_frames: 4,
            admin_grant_secs: 300,
            reset_policy: ResetPolicy::PerRun,
            extractor: "rollcall-extract".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let base = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        Ok(base.with_env(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Overlay `ROLLCALL_*` variables. Unparseable values are ignored with a warning.
    pub fn with_env(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = var("ROLLCALL_DATASET_DIR") {
            self.dataset_dir = v.into();
        }
        if let Some(v) = var("ROLLCALL_ATTENDANCE_PATH") {
            self.attendance_path = v.into();
        }
        if let Some(v) = var("ROLLCALL_ROSTER_PATH") {
            self.roster_path = v.into();
        }
        if let Some(v) = var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ROLLCALL_FRAMES_DIR") {
            self.frames_dir = (!v.is_empty()).then(|| v.into());
        }
        if let Some(v) = var("ROLLCALL_EXTRACTOR") {
            self.extractor = v;
        }
        self.tolerance = parsed(&var, "ROLLCALL_TOLERANCE", self.tolerance);
        self.verify_timeout_secs =
            parsed(&var, "ROLLCALL_VERIFY_TIMEOUT_SECS", self.verify_timeout_secs);
        self.warmup_frames = parsed(&var, "ROLLCALL_WARMUP_FRAMES", self.warmup_frames);
        self.admin_grant_secs = parsed(&var, "ROLLCALL_ADMIN_GRANT_SECS", self.admin_grant_secs);
        self.reset_policy = parsed(&var, "ROLLCALL_RESET_POLICY", self.reset_policy);
        self
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match var(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                current
            }
        },
        None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default().with_env(env(&[]));
        assert_eq!(config.tolerance, 0.5);
        assert_eq!(config.verify_timeout_secs, 10);
        assert_eq!(config.reset_policy, ResetPolicy::PerRun);
        assert!(config.frames_dir.is_none());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config: Config = toml::from_str(
            r#"
            dataset_dir = "/srv/rollcall/dataset"
            tolerance = 0.45
            reset_policy = "daily"
            "#,
        )
        .unwrap();
        assert_eq!(config.dataset_dir, PathBuf::from("/srv/rollcall/dataset"));
        assert_eq!(config.tolerance, 0.45);
        assert_eq!(config.reset_policy, ResetPolicy::Daily);
        assert_eq!(config.roster_path, PathBuf::from("admins.txt"));
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(toml::from_str::<Config>("tolerence = 0.4").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default().with_env(env(&[
            ("ROLLCALL_TOLERANCE", "0.6"),
            ("ROLLCALL_VERIFY_TIMEOUT_SECS", "30"),
            ("ROLLCALL_FRAMES_DIR", "/tmp/frames"),
            ("ROLLCALL_RESET_POLICY", "daily"),
        ]));
        assert_eq!(config.tolerance, 0.6);
        assert_eq!(config.verify_timeout_secs, 30);
        assert_eq!(config.frames_dir, Some(PathBuf::from("/tmp/frames")));
        assert_eq!(config.reset_policy, ResetPolicy::Daily);
    }

    #[test]
    fn test_bad_env_value_keeps_previous() {
        let config = Config::default().with_env(env(&[("ROLLCALL_TOLERANCE", "loose")]));
        assert_eq!(config.tolerance, 0.5);
    }
}
