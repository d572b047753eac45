use facetag_core::ScanParams;
use std::path::PathBuf;
use std::time::Duration;

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database holding the `photos` table and the task queue.
    pub db_path: PathBuf,
    /// Root directory of the object store; one subdirectory per bucket.
    pub storage_dir: PathBuf,
    /// Bucket holding uploaded source photos.
    pub photos_bucket: String,
    /// Bucket holding cropped faces.
    pub faces_bucket: String,
    /// SeetaFace frontal model file.
    pub model_path: PathBuf,
    /// Host serving faces and photos over HTTP (e.g. `api.example.net`).
    /// Unset: display references are `facetag://` handles.
    pub gateway_url: Option<String>,
    pub scan: ScanParams,
    /// Delay between queue polls when the previous poll found nothing.
    pub queue_poll: Duration,
    /// Messages taken per cropper invocation.
    pub queue_batch: usize,
    /// How long a received message stays hidden from other consumers.
    pub queue_lease: Duration,
    /// Deliveries before a crop task is dead-lettered.
    pub max_attempts: u32,
    /// Base delay for in-invocation retries and queue redelivery backoff.
    pub retry_base: Duration,
    pub bus: Bus,
}

impl Config {
    /// Load configuration from `FACETAG_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("FACETAG_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("facetag")
            });

        let defaults = ScanParams::default();
        let scan = ScanParams {
            min_face_size: parse_or(&var, "FACETAG_MIN_FACE_SIZE", defaults.min_face_size),
            score_threshold: parse_or(&var, "FACETAG_SCORE_THRESHOLD", defaults.score_threshold),
            pyramid_scale_factor: parse_or(
                &var,
                "FACETAG_PYRAMID_SCALE",
                defaults.pyramid_scale_factor,
            ),
            window_step: parse_or(&var, "FACETAG_WINDOW_STEP", defaults.window_step),
        };

        Self {
            db_path: var("FACETAG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("facetag.db")),
            storage_dir: var("FACETAG_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("buckets")),
            photos_bucket: var("FACETAG_BUCKET_PHOTOS").unwrap_or_else(|| "photos".to_string()),
            faces_bucket: var("FACETAG_BUCKET_FACES").unwrap_or_else(|| "faces".to_string()),
            model_path: var("FACETAG_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("seeta_fd_frontal_v1.0.bin")),
            gateway_url: var("FACETAG_GATEWAY_URL").filter(|v| !v.trim().is_empty()),
            scan,
            queue_poll: Duration::from_millis(parse_or(&var, "FACETAG_QUEUE_POLL_MS", 500)),
            queue_batch: parse_or(&var, "FACETAG_QUEUE_BATCH", 10),
            queue_lease: Duration::from_secs(parse_or(&var, "FACETAG_QUEUE_LEASE_SECS", 30)),
            max_attempts: parse_or(&var, "FACETAG_MAX_ATTEMPTS", 5),
            retry_base: Duration::from_millis(parse_or(&var, "FACETAG_RETRY_BASE_MS", 200)),
            bus: match var("FACETAG_BUS").as_deref() {
                Some("system") => Bus::System,
                _ => Bus::Session,
            },
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/u")]);
        assert_eq!(c.db_path, PathBuf::from("/home/u/.local/share/facetag/facetag.db"));
        assert_eq!(c.storage_dir, PathBuf::from("/home/u/.local/share/facetag/buckets"));
        assert_eq!(c.photos_bucket, "photos");
        assert_eq!(c.faces_bucket, "faces");
        assert_eq!(c.gateway_url, None);
        assert_eq!(c.scan, ScanParams::default());
        assert_eq!(c.queue_batch, 10);
        assert_eq!(c.queue_lease, Duration::from_secs(30));
        assert_eq!(c.max_attempts, 5);
        assert_eq!(c.bus, Bus::Session);
    }

    #[test]
    fn test_xdg_data_home() {
        let c = config(&[("XDG_DATA_HOME", "/xdg"), ("HOME", "/home/u")]);
        assert_eq!(c.db_path, PathBuf::from("/xdg/facetag/facetag.db"));
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("FACETAG_DATA_DIR", "/srv/facetag"),
            ("FACETAG_BUCKET_FACES", "crops"),
            ("FACETAG_GATEWAY_URL", "api.example.net"),
            ("FACETAG_MIN_FACE_SIZE", "40"),
            ("FACETAG_QUEUE_BATCH", "3"),
            ("FACETAG_BUS", "system"),
        ]);
        assert_eq!(c.db_path, PathBuf::from("/srv/facetag/facetag.db"));
        assert_eq!(c.faces_bucket, "crops");
        assert_eq!(c.gateway_url.as_deref(), Some("api.example.net"));
        assert_eq!(c.scan.min_face_size, 40);
        assert_eq!(c.queue_batch, 3);
        assert_eq!(c.bus, Bus::System);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let c = config(&[
            ("HOME", "/h"),
            ("FACETAG_MAX_ATTEMPTS", "many"),
            ("FACETAG_GATEWAY_URL", "  "),
        ]);
        assert_eq!(c.max_attempts, 5);
        assert_eq!(c.gateway_url, None);
    }
}
