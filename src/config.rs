use std::{collections::HashSet, env, path::PathBuf, time::Duration};

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trust_proxy: bool,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub database_path: PathBuf,
    pub jwt_secret: String,
    pub admin_emails: HashSet<String>,
    pub python_bin: String,
    pub processor_script: PathBuf,
    pub upload_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub processing_concurrency: usize,
    pub processing_timeout: Duration,
    pub reservation_ttl: Duration,
    pub sweep_interval: Duration,
    pub sweep_max_age: Duration,
    pub log_processing_timings: bool,
    pub log_task_queue_timings: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parse_u16(env::var("PORT").ok(), 5000);

        let trust_proxy = match env::var("TRUST_PROXY") {
            Ok(value) => {
                let normalized = value.trim().to_lowercase();
                !matches!(normalized.as_str(), "false" | "0" | "off" | "no")
            }
            Err(_) => true,
        };

        let is_production = env::var("NODE_ENV")
            .ok()
            .map(|value| value.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => {
                if is_production {
                    return Err(anyhow::anyhow!(
                        "JWT_SECRET environment variable is not set"
                    ));
                }
                tracing::warn!("JWT_SECRET is not set. Using an insecure development secret.");
                "dev-only-insecure-jwt-secret".to_string()
            }
        };

        let admin_emails = env::var("ADMIN_EMAILS")
            .unwrap_or_default()
            .split(',')
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .collect::<HashSet<_>>();

        let processing_concurrency = parse_usize(
            env::var("PROCESSING_CONCURRENCY")
                .ok()
                .or_else(|| env::var("MAX_CONCURRENT_PROCESSES").ok()),
            3,
        );

        let processing_timeout =
            Duration::from_millis(parse_u64(env::var("PROCESSOR_TIMEOUT_MS").ok(), 120_000));

        Ok(Self {
            port,
            trust_proxy,
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/users.db")),
            jwt_secret,
            admin_emails,
            python_bin: env::var("PYTHON_BIN").unwrap_or_else(|_| "python".to_string()),
            processor_script: env::var("PROCESSOR_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("upscale_script.py")),
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
            processed_dir: env::var("PROCESSED_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("processed")),
            max_upload_bytes: parse_usize(env::var("MAX_UPLOAD_BYTES").ok(), 100 * 1024 * 1024),
            processing_concurrency,
            processing_timeout,
            reservation_ttl: Duration::from_secs(parse_u64(
                env::var("RESERVATION_TTL_SECS").ok(),
                600,
            )),
            sweep_interval: Duration::from_secs(parse_u64(
                env::var("SWEEP_INTERVAL_SECS").ok(),
                300,
            )),
            sweep_max_age: Duration::from_secs(parse_u64(
                env::var("SWEEP_MAX_AGE_SECS").ok(),
                3600,
            )),
            log_processing_timings: env::var("LOG_PROCESSING_TIMINGS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_task_queue_timings: env::var("LOG_TASK_QUEUE_TIMINGS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        self.admin_emails
            .contains(&email.trim().to_ascii_lowercase())
    }
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_u64(value: Option<String>, fallback: u64) -> u64 {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn parse_helpers_fall_back_on_garbage() {
        assert_eq!(parse_u16(Some("abc".to_string()), 5000), 5000);
        assert_eq!(parse_u16(Some("0".to_string()), 5000), 5000);
        assert_eq!(parse_u16(Some("8080".to_string()), 5000), 8080);
        assert_eq!(parse_usize(None, 3), 3);
        assert_eq!(parse_u64(Some("250".to_string()), 1), 250);
    }

    #[test]
    fn admin_email_match_is_case_insensitive() {
        let mut config = test_config();
        config.admin_emails.insert("ops@example.com".to_string());
        assert!(config.is_admin_email("Ops@Example.COM"));
        assert!(config.is_admin_email("  ops@example.com "));
        assert!(!config.is_admin_email("someone@example.com"));
    }

    pub(crate) fn test_config() -> Config {
        Config {
            port: 0,
            trust_proxy: false,
            tls_key_path: None,
            tls_cert_path: None,
            database_path: PathBuf::from(":memory:"),
            jwt_secret: "test-secret".to_string(),
            admin_emails: HashSet::new(),
            python_bin: "python".to_string(),
            processor_script: PathBuf::from("upscale_script.py"),
            upload_dir: std::env::temp_dir(),
            processed_dir: std::env::temp_dir(),
            max_upload_bytes: 100 * 1024 * 1024,
            processing_concurrency: 3,
            processing_timeout: Duration::from_secs(120),
            reservation_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
            sweep_max_age: Duration::from_secs(3600),
            log_processing_timings: false,
            log_task_queue_timings: false,
        }
    }
}
