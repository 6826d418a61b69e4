use std::{net::SocketAddr, path::PathBuf};

use herald_agent::settings::env_path;

const DEV_SESSION_SECRET: &str = "dev-insecure-change-me";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub bind: SocketAddr,
    pub session_secret: Vec<u8>,
    pub allowed_origins: Vec<String>,
    pub credentials_dir: PathBuf,
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("HERALD_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind: SocketAddr = bind
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid HERALD_BIND {bind:?}: {e}"))?;

        let session_secret = match std::env::var("HERALD_SESSION_SECRET") {
            Ok(v) if !v.trim().is_empty() => v.into_bytes(),
            _ => {
                tracing::warn!("HERALD_SESSION_SECRET is not set; using the insecure dev secret");
                DEV_SESSION_SECRET.as_bytes().to_vec()
            }
        };

        // Dev-friendly defaults; production should list its origins explicitly.
        let allowed_origins = parse_origins(
            &std::env::var("HERALD_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string()),
        );

        let data_root = env_path("HERALD_DATA_ROOT").unwrap_or_else(|| PathBuf::from("data"));
        let credentials_dir =
            env_path("HERALD_CREDENTIALS_DIR").unwrap_or_else(|| data_root.join("credentials"));

        Ok(Self {
            bind,
            session_secret,
            allowed_origins,
            credentials_dir,
        })
    }

    /// Config for in-process tests and embedding.
    pub fn for_secret(secret: &[u8], credentials_dir: PathBuf) -> Self {
        Self {
            bind: ([127, 0, 0, 1], 0).into(),
            session_secret: secret.to_vec(),
            allowed_origins: Vec::new(),
            credentials_dir,
        }
    }
}
