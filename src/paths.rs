//! Resolution of the daemon's on-disk and runtime locations: config
//! directory, user-data assets, bundled default assets, and the control
//! socket's runtime directory.

use std::path::PathBuf;

use clap::Parser;

/// Bundled default assets and overlay, shipped alongside the crate the way
/// `rust_embed`'s `folder` attribute roots at a compile-time relative path —
/// here resolved at runtime instead, since the daemon must be able to see
/// an operator's on-disk overrides.
fn bundled_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets")
}

#[derive(Debug, Parser)]
#[command(name = "voicebridged", version, about = "Voice-chat occupancy bridge daemon")]
pub struct Cli {
    /// Override the config directory (default: platform config dir).
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Override the data directory (default: platform data dir).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Override the runtime directory holding the control socket.
    #[arg(long)]
    pub runtime_dir: Option<PathBuf>,

    /// HTTP bind address for the read-only JSON/static server.
    #[arg(long, default_value = "127.0.0.1:17891")]
    pub http_addr: String,

    /// Log level filter, forwarded to `tracing_subscriber::EnvFilter` when
    /// `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct Paths {
    pub config_path: PathBuf,
    pub api_key_path: PathBuf,
    pub user_assets_dir: PathBuf,
    pub default_assets_dir: PathBuf,
    pub user_overlay_dir: PathBuf,
    pub default_overlay_dir: PathBuf,
    pub control_socket_path: PathBuf,
}

impl Paths {
    pub fn resolve(cli: &Cli) -> Self {
        let config_dir = cli
            .config_dir
            .clone()
            .or_else(|| dirs::config_dir().map(|d| d.join("voicebridge")))
            .unwrap_or_else(|| PathBuf::from(".voicebridge/config"));

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("voicebridge")))
            .unwrap_or_else(|| PathBuf::from(".voicebridge/data"));

        let runtime_dir = cli
            .runtime_dir
            .clone()
            .or_else(|| std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from))
            .unwrap_or_else(|| data_dir.clone());

        Self {
            config_path: config_dir.join("config.json"),
            api_key_path: config_dir.join("apikey"),
            user_assets_dir: data_dir.join("assets"),
            default_assets_dir: bundled_root().join("defaults"),
            user_overlay_dir: data_dir.join("overlay"),
            default_overlay_dir: bundled_root().join("overlay"),
            control_socket_path: runtime_dir.join("voicebridge.sock"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&self.user_assets_dir)?;
        if let Some(parent) = self.control_socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_overrides_win_over_platform_defaults() {
        let cli = Cli {
            config_dir: Some(PathBuf::from("/tmp/cfg")),
            data_dir: Some(PathBuf::from("/tmp/data")),
            runtime_dir: Some(PathBuf::from("/tmp/run")),
            http_addr: "127.0.0.1:17891".to_string(),
            log_level: "info".to_string(),
        };
        let paths = Paths::resolve(&cli);
        assert_eq!(paths.config_path, PathBuf::from("/tmp/cfg/config.json"));
        assert_eq!(paths.user_assets_dir, PathBuf::from("/tmp/data/assets"));
        assert_eq!(
            paths.control_socket_path,
            PathBuf::from("/tmp/run/voicebridge.sock")
        );
    }
}
