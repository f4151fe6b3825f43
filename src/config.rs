// Configuration for the proxy
//
// Configuration is loaded in order of precedence:
// 1. Command-line flags (highest priority, see cli.rs)
// 2. Environment variables
// 3. Built-in defaults (lowest priority)
//
// The process runs inside a pod, so there is no config file: everything
// arrives through the environment the way the deployment manifest sets it.

use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Host of the inference backend (the pod's service or pod IP)
    pub backend_host: String,

    /// Port the backend serves OpenAI Chat Completions on
    pub backend_port: u16,

    /// Namespace the backend pod lives in
    pub namespace: String,

    /// Fixed name of the backend pod
    pub pod_name: String,

    /// ConfigMap that persists the active model id across restarts
    pub configmap_name: String,

    /// Default model id when the configmap holds nothing
    pub model_id: String,

    /// GPUs requested by the backend pod
    pub gpu_count: u32,

    /// Default CPU offload for profiles that do not set one (GiB)
    pub cpu_offload_gb: u32,

    /// Port this proxy listens on
    pub port: u16,

    /// Public endpoint advertised in /proxy/version
    pub public_endpoint: Option<String>,

    /// Delete the pod after this much request silence
    pub idle_timeout: Duration,

    /// How often the idle checker wakes up
    pub idle_check_interval: Duration,

    /// Upper bound on pod creation + readiness
    pub startup_timeout: Duration,

    /// Readiness poll cadence during startup
    pub readiness_poll_interval: Duration,

    /// How often the drift reconciler compares pod spec to profile
    pub drift_interval: Duration,

    /// Detect XML-embedded tool calls in backend content streams
    pub enable_xml_parsing: bool,

    /// Log destination: "stdout" or a file path
    pub log_output: String,

    /// Safety cap applied to max_tokens on translated requests
    pub max_tokens_cap: u32,

    /// Prune conversations longer than this many messages before forwarding
    pub context_prune_threshold: usize,

    /// Container image for the backend pod
    pub backend_image: String,
}

impl Config {
    /// Backend base URL, e.g. "http://vllm:8000"
    pub fn backend_url(&self) -> String {
        format!("http://{}:{}", self.backend_host, self.backend_port)
    }

    /// Load configuration: env vars -> defaults
    pub fn from_env() -> Self {
        Self {
            backend_host: env_str("PODCHILL_BACKEND_HOST", "localhost"),
            backend_port: env_parse("PODCHILL_BACKEND_PORT", 8000),
            namespace: env_str("PODCHILL_NAMESPACE", "default"),
            pod_name: env_str("PODCHILL_POD_NAME", "vllm-backend"),
            configmap_name: env_str("PODCHILL_CONFIGMAP_NAME", "podchill-state"),
            model_id: env_str("PODCHILL_MODEL_ID", "default"),
            gpu_count: env_parse("PODCHILL_GPU_COUNT", 1),
            cpu_offload_gb: env_parse("PODCHILL_CPU_OFFLOAD_GB", 0),
            port: env_parse("PODCHILL_PORT", 8080),
            public_endpoint: std::env::var("PODCHILL_PUBLIC_ENDPOINT").ok(),
            idle_timeout: env_duration("PODCHILL_IDLE_TIMEOUT", Duration::from_secs(600)),
            idle_check_interval: env_duration(
                "PODCHILL_IDLE_CHECK_INTERVAL",
                Duration::from_secs(10),
            ),
            startup_timeout: env_duration("PODCHILL_STARTUP_TIMEOUT", Duration::from_secs(120)),
            readiness_poll_interval: env_duration(
                "PODCHILL_READINESS_POLL_INTERVAL",
                Duration::from_secs(2),
            ),
            drift_interval: env_duration("PODCHILL_DRIFT_INTERVAL", Duration::from_secs(30)),
            enable_xml_parsing: env_bool("PODCHILL_ENABLE_XML_PARSING", true),
            log_output: env_str("PODCHILL_LOG_OUTPUT", "stdout"),
            max_tokens_cap: env_parse("PODCHILL_MAX_TOKENS_CAP", 16_384),
            context_prune_threshold: env_parse("PODCHILL_CONTEXT_PRUNE_THRESHOLD", 50),
            backend_image: env_str("PODCHILL_BACKEND_IMAGE", "vllm/vllm-openai:latest"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_host: "localhost".to_string(),
            backend_port: 8000,
            namespace: "default".to_string(),
            pod_name: "vllm-backend".to_string(),
            configmap_name: "podchill-state".to_string(),
            model_id: "default".to_string(),
            gpu_count: 1,
            cpu_offload_gb: 0,
            port: 8080,
            public_endpoint: None,
            idle_timeout: Duration::from_secs(600),
            idle_check_interval: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(120),
            readiness_poll_interval: Duration::from_secs(2),
            drift_interval: Duration::from_secs(30),
            enable_xml_parsing: true,
            log_output: "stdout".to_string(),
            max_tokens_cap: 16_384,
            context_prune_threshold: 50,
            backend_image: "vllm/vllm-openai:latest".to_string(),
        }
    }
}

// ============================================================================
// Env Helpers
// ============================================================================

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parse a duration env var
///
/// Accepts bare seconds ("600") or humantime strings ("10m", "90s").
fn env_duration(key: &str, default: Duration) -> Duration {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    if let Ok(secs) = raw.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    match humantime::parse_duration(&raw) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Warning: invalid duration in {}={}: {}", key, raw, e);
            default
        }
    }
}
