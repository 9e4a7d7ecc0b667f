use log::warn;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "json", "md", "txt", "html", "css", "rs", "toml", "yaml",
    "yml", "sh", "csv",
];

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub interpreter: String,
    pub script_extension: String,
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
    pub max_source_bytes: usize,
    pub rate_limit: usize,
    pub rate_window: Duration,
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            interpreter: "python3".to_string(),
            script_extension: "py".to_string(),
            scratch_dir: env::temp_dir().join("livesync-scratch"),
            timeout: Duration::from_secs(30),
            max_source_bytes: 50 * 1024,
            rate_limit: 5,
            rate_window: Duration::from_secs(60),
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub watch_root: PathBuf,
    pub observer_buffer: usize,
    pub allowed_extensions: Vec<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub sandbox: SandboxConfig,
}

impl AppConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SandboxConfig::default();
        let sandbox = SandboxConfig {
            interpreter: lookup("INTERPRETER").unwrap_or(defaults.interpreter),
            script_extension: lookup("SCRIPT_EXTENSION").unwrap_or(defaults.script_extension),
            scratch_dir: lookup("SCRATCH_DIR").map(PathBuf::from).unwrap_or(defaults.scratch_dir),
            timeout: Duration::from_secs(parse_or(&lookup, "EXEC_TIMEOUT_SECS", defaults.timeout.as_secs())),
            max_source_bytes: parse_or(&lookup, "EXEC_MAX_SOURCE_BYTES", defaults.max_source_bytes),
            rate_limit: parse_or(&lookup, "EXEC_RATE_LIMIT", defaults.rate_limit),
            rate_window: Duration::from_secs(parse_or(
                &lookup,
                "EXEC_RATE_WINDOW_SECS",
                defaults.rate_window.as_secs(),
            )),
            max_output_bytes: parse_or(&lookup, "EXEC_MAX_OUTPUT_BYTES", defaults.max_output_bytes),
        };

        let allowed_extensions = match lookup("ALLOWED_EXTENSIONS") {
            Some(list) => list
                .split(',')
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            None => DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        };

        AppConfig {
            port: parse_or(&lookup, "PORT", 3000),
            watch_root: lookup("WATCH_ROOT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            observer_buffer: parse_or(&lookup, "OBSERVER_BUFFER", 256),
            allowed_extensions,
            cert_path: lookup("CERT_PATH"),
            key_path: lookup("KEY_PATH"),
            sandbox,
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}='{}', using {}", key, raw, default);
            default
        }),
        None => default,
    }
}
