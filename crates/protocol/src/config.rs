use serde::{Deserialize, Serialize};

/// Top-level relay configuration, loaded from an optional TOML file and then
/// overridden field-by-field: environment variable first, then CLI flag.
/// CLI wins because it is the most specific and the most visible at
/// invocation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Extra logging.
    #[serde(default)]
    pub verbose: bool,
    /// Reserved for future use; currently only gates the default tracing
    /// filter level.
    #[serde(default)]
    pub debug: bool,
    /// Port the HTTP/websocket endpoint listens on.
    #[serde(default = "default_endpoint_port")]
    pub endpoint_port: u16,
    /// Start of the ephemeral UDP port range handed to the WebRTC setting
    /// engine for media.
    #[serde(default = "default_webrtc_udp_start")]
    pub webrtc_udp_start: u16,
    /// End of the ephemeral UDP port range (inclusive).
    #[serde(default = "default_webrtc_udp_end")]
    pub webrtc_udp_end: u16,
    /// `host:port` of the STUN server used for ICE gathering.
    #[serde(default = "default_stun_server")]
    pub stun_server: String,
    /// Path to a TLS certificate (self-signed one is generated if absent).
    pub tls_cert: Option<String>,
    /// Path to a TLS private key (self-signed one is generated if absent).
    pub tls_key: Option<String>,
    /// Augment the media engine's default codec set with H.265 (payload
    /// types 48/49, clock 90000, RTX apt=48) in addition to the default set.
    #[serde(default)]
    pub enable_h265: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            debug: false,
            endpoint_port: default_endpoint_port(),
            webrtc_udp_start: default_webrtc_udp_start(),
            webrtc_udp_end: default_webrtc_udp_end(),
            stun_server: default_stun_server(),
            tls_cert: None,
            tls_key: None,
            enable_h265: false,
        }
    }
}

impl RelayConfig {
    /// Apply the `VERBOSE`/`DEBUG`/`ENDPOINT_PORT`/`WEBRTC_UDP_START`/
    /// `WEBRTC_UDP_END`/`STUN_SERVER` environment variables on top of
    /// whatever the TOML file (or defaults) produced. A variable that is
    /// absent or fails to parse leaves the existing value untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("VERBOSE") {
            self.verbose = v;
        }
        if let Some(v) = env_bool("DEBUG") {
            self.debug = v;
        }
        if let Some(v) = env_parsed("ENDPOINT_PORT") {
            self.endpoint_port = v;
        }
        if let Some(v) = env_parsed("WEBRTC_UDP_START") {
            self.webrtc_udp_start = v;
        }
        if let Some(v) = env_parsed("WEBRTC_UDP_END") {
            self.webrtc_udp_end = v;
        }
        if let Ok(v) = std::env::var("STUN_SERVER") {
            self.stun_server = v;
        }
        if let Ok(v) = std::env::var("TLS_CERT") {
            self.tls_cert = Some(v);
        }
        if let Ok(v) = std::env::var("TLS_KEY") {
            self.tls_key = Some(v);
        }
        if let Some(v) = env_bool("ENABLE_H265") {
            self.enable_h265 = v;
        }
    }

    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.endpoint_port == 0 {
            issues.push("ERROR: endpoint_port must be between 1 and 65535, got 0.".to_string());
        }

        if self.webrtc_udp_start == 0 {
            issues.push("ERROR: webrtc_udp_start must be between 1 and 65535, got 0.".to_string());
        }
        if self.webrtc_udp_end < self.webrtc_udp_start {
            issues.push(format!(
                "ERROR: webrtc_udp_end ({}) must be >= webrtc_udp_start ({}).",
                self.webrtc_udp_end, self.webrtc_udp_start
            ));
        }
        if self.webrtc_udp_end - self.webrtc_udp_start < 10 {
            issues.push(format!(
                "WARNING: WebRTC UDP port range [{}, {}] spans fewer than 10 ports, \
                 which limits how many concurrent peer connections can gather candidates.",
                self.webrtc_udp_start, self.webrtc_udp_end
            ));
        }

        if !self.stun_server.contains(':') {
            issues.push(format!(
                "ERROR: stun_server '{}' must be in 'host:port' form. \
                 Example: stun.l.google.com:19302",
                self.stun_server
            ));
        }

        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert '{cert}' does not exist."));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key '{key}' does not exist."));
                }
            }
            (Some(_), None) => {
                issues.push(
                    "WARNING: tls_cert is set but tls_key is not. \
                     Both must be set for custom TLS, or omit both for an auto-generated certificate."
                        .to_string(),
                );
            }
            (None, Some(_)) => {
                issues.push(
                    "WARNING: tls_key is set but tls_cert is not. \
                     Both must be set for custom TLS, or omit both for an auto-generated certificate."
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| match v.as_str() {
        "1" | "true" | "TRUE" | "True" => Some(true),
        "0" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    })
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn default_endpoint_port() -> u16 {
    8088
}
fn default_webrtc_udp_start() -> u16 {
    10000
}
fn default_webrtc_udp_end() -> u16 {
    20000
}
fn default_stun_server() -> String {
    "stun.l.google.com:19302".to_string()
}
