//! Configuration types for the server and the client.
//!
//! Server behaviour is controlled through [`ServerConfig`], built via its
//! [`ServerConfigBuilder`]; the client side has the much smaller
//! [`ClientConfig`]. Both follow the same pattern: clamping setters, sane
//! defaults, and a validating `build()`.

use crate::error::FileProcError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default address the server listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:50051";

/// Default size of each outbound chunk read from an output artifact.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Default size of each chunk the client uploads.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// Configuration for a fileproc server.
///
/// # Example
/// ```rust
/// use fileproc::ServerConfig;
///
/// let config = ServerConfig::builder()
///     .listen_addr("127.0.0.1:50051".parse().unwrap())
///     .read_chunk_size(64 * 1024)
///     .build()
///     .unwrap();
/// assert_eq!(config.read_chunk_size, 64 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the gRPC server binds. Default: `0.0.0.0:50051`.
    pub listen_addr: SocketAddr,

    /// Directory that holds staged artifacts. Default: the OS temp dir.
    ///
    /// Created on startup if missing. Every artifact placed here is owned by
    /// exactly one in-flight request and removed before that request ends.
    pub staging_dir: PathBuf,

    /// Bytes read from the output artifact per outbound message. Default: 4096.
    ///
    /// Purely internal: callers must not assume anything about chunk
    /// boundaries on the response stream.
    pub read_chunk_size: usize,

    /// Depth of the per-request outbound channel. Default: 4.
    ///
    /// The response streamer blocks once this many chunks are queued and not
    /// yet taken by the transport, so memory per request stays bounded at
    /// roughly `outbound_buffer * read_chunk_size`.
    pub outbound_buffer: usize,

    /// Append-only operation log. Default: none (tracing only).
    pub log_file: Option<PathBuf>,

    /// Collaborator programs invoked by the operation registry.
    pub programs: ExecutorPrograms,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            staging_dir: std::env::temp_dir(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            outbound_buffer: 4,
            log_file: None,
            programs: ExecutorPrograms::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new builder for `ServerConfig`.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Program names (or absolute paths) for the four collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorPrograms {
    /// Ghostscript, used by CompressPDF. Default: `gs`.
    pub ghostscript: String,
    /// Poppler's pdftotext, used by ConvertToTXT. Default: `pdftotext`.
    pub pdftotext: String,
    /// ImageMagick, used by ConvertImageFormat and ResizeImage. Default: `convert`.
    pub imagemagick: String,
}

impl Default for ExecutorPrograms {
    fn default() -> Self {
        Self {
            ghostscript: "gs".to_string(),
            pdftotext: "pdftotext".to_string(),
            imagemagick: "convert".to_string(),
        }
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = dir.into();
        self
    }

    pub fn read_chunk_size(mut self, n: usize) -> Self {
        self.config.read_chunk_size = n.max(1);
        self
    }

    pub fn outbound_buffer(mut self, n: usize) -> Self {
        self.config.outbound_buffer = n.max(1);
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_file = Some(path.into());
        self
    }

    pub fn ghostscript(mut self, program: impl Into<String>) -> Self {
        self.config.programs.ghostscript = program.into();
        self
    }

    pub fn pdftotext(mut self, program: impl Into<String>) -> Self {
        self.config.programs.pdftotext = program.into();
        self
    }

    pub fn imagemagick(mut self, program: impl Into<String>) -> Self {
        self.config.programs.imagemagick = program.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServerConfig, FileProcError> {
        let c = &self.config;
        if c.read_chunk_size == 0 {
            return Err(FileProcError::InvalidConfig(
                "read chunk size must be ≥ 1".into(),
            ));
        }
        if c.staging_dir.as_os_str().is_empty() {
            return Err(FileProcError::InvalidConfig(
                "staging directory must not be empty".into(),
            ));
        }
        let programs = &c.programs;
        for (name, program) in [
            ("ghostscript", &programs.ghostscript),
            ("pdftotext", &programs.pdftotext),
            ("imagemagick", &programs.imagemagick),
        ] {
            if program.trim().is_empty() {
                return Err(FileProcError::InvalidConfig(format!(
                    "{name} program must not be empty"
                )));
            }
        }
        Ok(self.config)
    }
}

/// Configuration for [`crate::client::FileProcessorClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bytes per uploaded content chunk. Default: 1 MiB.
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n.max(1);
        self
    }

    pub fn build(self) -> Result<ClientConfig, FileProcError> {
        if self.config.chunk_size == 0 {
            return Err(FileProcError::InvalidConfig(
                "chunk size must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ServerConfig::default();
        assert_eq!(c.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(c.read_chunk_size, 4096);
        assert_eq!(c.programs.ghostscript, "gs");
        assert_eq!(c.programs.imagemagick, "convert");
        assert!(c.log_file.is_none());
    }

    #[test]
    fn setters_clamp_zero_sizes() {
        let c = ServerConfig::builder()
            .read_chunk_size(0)
            .outbound_buffer(0)
            .build()
            .unwrap();
        assert_eq!(c.read_chunk_size, 1);
        assert_eq!(c.outbound_buffer, 1);
    }

    #[test]
    fn empty_program_is_rejected() {
        let err = ServerConfig::builder().pdftotext("  ").build().unwrap_err();
        assert!(matches!(err, FileProcError::InvalidConfig(_)));
        assert!(err.to_string().contains("pdftotext"));
    }

    #[test]
    fn empty_staging_dir_is_rejected() {
        let err = ServerConfig::builder().staging_dir("").build().unwrap_err();
        assert!(matches!(err, FileProcError::InvalidConfig(_)));
    }

    #[test]
    fn config_serialises_for_startup_log() {
        let c = ServerConfig::builder().log_file("server.log").build().unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"read_chunk_size\":4096"), "got: {json}");
        assert!(json.contains("server.log"));
    }

    #[test]
    fn client_chunk_size_defaults_to_one_mebibyte() {
        assert_eq!(ClientConfig::default().chunk_size, 1024 * 1024);
        let c = ClientConfig::builder().chunk_size(0).build().unwrap();
        assert_eq!(c.chunk_size, 1);
    }
}
