use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for a queue and the processor that drains it.
///
/// Sources, later ones winning: built-in defaults, an optional
/// `fmq.toml` in the working directory, an explicit file passed to
/// [`Settings::load`], and `FMQ_*` environment variables
/// (`FMQ_QUEUE_FILE`, `FMQ_BATCH_SIZE`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// The JSON file backing the queue.
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,
    /// Seconds to wait after a batch that delivered nothing.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between individual delivery attempts.
    #[serde(default = "default_throttle")]
    pub delivery_throttle_seconds: f64,
    /// Where messages go once they run out of attempts.  Without
    /// one, they are dropped.
    #[serde(default)]
    pub dead_letter_file: Option<PathBuf>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Stamp messages as delivered when they are taken from the
    /// queue, rather than when delivery is confirmed.
    #[serde(default)]
    pub stamp_on_dequeue: bool,
    /// Root of the per-recipient inbox directories.
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: PathBuf,
    /// Defaults to the queue file with a `.lock` suffix.
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
    /// Where producers submit messages while a processor holds the
    /// lock.  Defaults to the queue file with an `.incoming` suffix.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

fn default_queue_file() -> PathBuf { PathBuf::from("runtime/queue.json") }

fn default_poll_interval() -> f64 { 5.0 }

fn default_batch_size() -> usize { 3 }

fn default_throttle() -> f64 { 1.0 }

fn default_max_attempts() -> u32 { 1 }

fn default_inbox_dir() -> PathBuf { PathBuf::from("runtime/inbox") }

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to load settings: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_file: default_queue_file(),
            poll_interval_seconds: default_poll_interval(),
            batch_size: default_batch_size(),
            delivery_throttle_seconds: default_throttle(),
            dead_letter_file: None,
            max_attempts: default_max_attempts(),
            stamp_on_dequeue: false,
            inbox_dir: default_inbox_dir(),
            lock_file: None,
            spool_dir: None,
        }
    }
}

impl Settings {
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(Some("fmq"), file, "FMQ")
    }

    fn load_from(
        default_file: Option<&str>,
        file: Option<&Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(name) = default_file {
            builder = builder.add_source(File::with_name(name).required(false));
        }

        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(true));
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix(env_prefix).try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be at least 1".to_owned(),
            });
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "must be at least 1".to_owned(),
            });
        }

        for (field, seconds) in [
            ("poll_interval_seconds", self.poll_interval_seconds),
            ("delivery_throttle_seconds", self.delivery_throttle_seconds),
        ] {
            Duration::try_from_secs_f64(seconds).map_err(|e| ConfigError::Invalid {
                field,
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_seconds).unwrap_or_default()
    }

    #[must_use]
    pub fn delivery_throttle(&self) -> Duration {
        Duration::try_from_secs_f64(self.delivery_throttle_seconds).unwrap_or_default()
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.beside_queue_file(".lock"))
    }

    #[must_use]
    pub fn spool_path(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(|| self.beside_queue_file(".incoming"))
    }

    fn beside_queue_file(&self, suffix: &str) -> PathBuf {
        let mut name = self.queue_file.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_processor_defaults() {
        let settings = Settings::default();

        assert_eq!(settings.poll_interval(), Duration::from_secs(5));
        assert_eq!(settings.batch_size, 3);
        assert_eq!(settings.max_attempts, 1);
        assert!(settings.dead_letter_file.is_none());
        assert_eq!(settings.lock_path(), PathBuf::from("runtime/queue.json.lock"));
        assert_eq!(settings.spool_path(), PathBuf::from("runtime/queue.json.incoming"));
        settings.validate().expect("defaults are valid");
    }

    #[test]
    fn loads_an_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "queue_file = \"/tmp/agents/queue.json\"\n\
             poll_interval_seconds = 0.5\n\
             batch_size = 10\n\
             dead_letter_file = \"/tmp/agents/dead.json\"\n",
        )
        .expect("write");

        let settings =
            Settings::load_from(None, Some(&path), "FMQ_EXPLICIT_FILE_TEST").expect("load");

        assert_eq!(settings.queue_file, PathBuf::from("/tmp/agents/queue.json"));
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.batch_size, 10);
        assert_eq!(
            settings.dead_letter_file,
            Some(PathBuf::from("/tmp/agents/dead.json"))
        );
        assert_eq!(settings.delivery_throttle(), Duration::from_secs(1));
    }

    #[test]
    fn environment_overrides_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "batch_size = 10\nmax_attempts = 2\n").expect("write");

        std::env::set_var("FMQ_ENV_TEST_BATCH_SIZE", "7");
        std::env::set_var("FMQ_ENV_TEST_QUEUE_FILE", "/srv/fmq/queue.json");
        let settings = Settings::load_from(None, Some(&path), "FMQ_ENV_TEST");
        std::env::remove_var("FMQ_ENV_TEST_BATCH_SIZE");
        std::env::remove_var("FMQ_ENV_TEST_QUEUE_FILE");

        let settings = settings.expect("load");
        assert_eq!(settings.batch_size, 7);
        assert_eq!(settings.max_attempts, 2);
        assert_eq!(settings.queue_file, PathBuf::from("/srv/fmq/queue.json"));
    }

    #[test]
    fn invalid_environment_values_are_rejected() {
        std::env::set_var("FMQ_BAD_ENV_TEST_BATCH_SIZE", "0");
        let result = Settings::load_from(None, None, "FMQ_BAD_ENV_TEST");
        std::env::remove_var("FMQ_BAD_ENV_TEST_BATCH_SIZE");

        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "batch_size",
                ..
            })
        ));
    }

    #[test]
    fn rejects_invalid_values() {
        let zero_batch = Settings {
            batch_size: 0,
            ..Settings::default()
        };
        assert!(matches!(
            zero_batch.validate(),
            Err(ConfigError::Invalid {
                field: "batch_size",
                ..
            })
        ));

        let negative = Settings {
            delivery_throttle_seconds: -1.0,
            ..Settings::default()
        };
        assert!(matches!(
            negative.validate(),
            Err(ConfigError::Invalid {
                field: "delivery_throttle_seconds",
                ..
            })
        ));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Settings::load_from(None, Some(&dir.path().join("nope.toml")), "FMQ_MISSING_FILE_TEST")
            .expect_err("missing");
        assert!(matches!(err, ConfigError::Load { .. }));
    }
}
