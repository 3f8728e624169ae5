//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Everything the binary needs to assemble and serve the pipeline.
///
/// The core takes its own explicit [`velocity_core::PipelineConfig`]; this
/// struct only owns the HTTP surface and where documents live.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Root directory served by the filesystem document store.
    pub documents_dir: PathBuf,
    /// When set, pipeline endpoints require `Authorization: Bearer <token>`.
    pub bearer_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], 8600).into(),
            documents_dir: PathBuf::from("documents"),
            bearer_token: None,
        }
    }
}

impl ServerConfig {
    /// Read overrides from `VELOCITY_BIND`, `VELOCITY_DOCUMENTS_DIR`, and
    /// `VELOCITY_BEARER_TOKEN`. Only the binary calls this; the core never
    /// reads the environment.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("VELOCITY_BIND") {
            config.bind_addr = bind
                .parse()
                .map_err(|e| format!("invalid VELOCITY_BIND `{bind}`: {e}"))?;
        }
        if let Ok(dir) = std::env::var("VELOCITY_DOCUMENTS_DIR") {
            config.documents_dir = PathBuf::from(dir);
        }
        if let Ok(token) = std::env::var("VELOCITY_BEARER_TOKEN") {
            if !token.is_empty() {
                config.bearer_token = Some(token);
            }
        }
        Ok(config)
    }
}
