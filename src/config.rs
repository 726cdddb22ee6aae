use std::path::Path;

use config::{Config, File, FileFormat};
use serde::Deserialize;

use crate::error::Error;

/// Configuration file the server reads from its working directory.
pub const CONFIG_FILE: &str = "server.config";

/// The `server` section of the ini-style configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "document-root")]
    pub document_root: String,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    server: ServerConfig,
}

impl ServerConfig {
    /// Loads the configuration from an ini file with a `server` section holding
    /// `host`, `port` and `document-root`.
    pub fn load(path: &str) -> Result<Self, Error> {
        if !Path::new(path).exists() {
            return Err(Error::ConfigNotFound);
        }
        let parsed = Config::builder()
            .add_source(File::new(path, FileFormat::Ini))
            .build()?;
        let file: ConfigFile = parsed.try_deserialize()?;
        Ok(file.server)
    }

    /// Applies command-line overrides on top of the file values.
    pub fn apply_overrides(
        mut self,
        port: Option<u16>,
        host: Option<String>,
        document_root: Option<String>,
    ) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(document_root) = document_root {
            self.document_root = document_root;
        }
        self
    }
}
