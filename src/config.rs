/// Traffic handling mode, fixed at sandbox boot. Build-time environments
/// with no secrets to inject run in bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Mitm,
    Bypass,
}

/// Top-level configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub http_port: u16,
    pub https_port: u16,
    pub team_id: String,
    pub sandbox_id: String,
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let mode = match std::env::var("EGRESS_MODE").as_deref() {
            Ok("bypass") => Mode::Bypass,
            _ => Mode::Mitm,
        };

        let http_port = std::env::var("EGRESS_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let https_port = std::env::var("EGRESS_HTTPS_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8443);

        let team_id = std::env::var("EGRESS_TEAM_ID").unwrap_or_default();

        let sandbox_id = std::env::var("EGRESS_SANDBOX_ID").unwrap_or_default();

        let shutdown_grace_secs = std::env::var("EGRESS_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Self {
            mode,
            http_port,
            https_port,
            team_id,
            sandbox_id,
            shutdown_grace_secs,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Mitm,
            http_port: 8080,
            https_port: 8443,
            team_id: String::new(),
            sandbox_id: String::new(),
            shutdown_grace_secs: 10,
        }
    }
}
