//! CLI arguments and server configuration defaults.

use clap::Parser;
use clap::builder::BoolishValueParser;
use shadow_rs::formatcp;

use crate::build;
use crate::path_guard::DEFAULT_SYSTEM_DIRS;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_SECRET_KEY: &str = "api-file-provider";
pub const DEFAULT_KEY_ROTATION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_KEY_HISTORY: usize = 1;
pub const DEFAULT_JWT_LIFETIME_SECS: u64 = 60 * 60;
pub const DEFAULT_UPLOAD_ROOT: &str = "/opt/uploaded_data";
pub const DEFAULT_META_STORE_URL: &str = "http://127.0.0.1:8000";
pub const UPSTREAM_TIMEOUT_SECS: u64 = 30;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "file-provider", version = VERSION_INFO, about = "Token based file provider")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "FILE_PROVIDER_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILE_PROVIDER_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "SECRET_KEY",
        default_value = DEFAULT_SECRET_KEY,
        hide_env_values = true,
        help = "Base secret for token signing keys"
    )]
    pub secret_key: String,
    #[arg(
        long,
        env = "KEY_ROTATION_SECS",
        default_value_t = DEFAULT_KEY_ROTATION_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Signing key rotation interval in seconds"
    )]
    pub key_rotation_secs: u64,
    #[arg(
        long,
        env = "KEY_HISTORY",
        default_value_t = DEFAULT_KEY_HISTORY,
        help = "Number of previous signing keys accepted for verification"
    )]
    pub key_history: usize,
    #[arg(
        long,
        env = "JWT_LIFETIME",
        default_value_t = DEFAULT_JWT_LIFETIME_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Download token lifetime in seconds"
    )]
    pub jwt_lifetime: u64,
    #[arg(
        long,
        env = "TOKEN_LEEWAY_SECS",
        default_value_t = 0,
        help = "Clock skew tolerated when checking token validity"
    )]
    pub token_leeway_secs: u64,
    #[arg(
        long,
        env = "UPLOADED_FILE_PATH_PREFIX",
        default_value = DEFAULT_UPLOAD_ROOT,
        help = "Root directory for uploaded files"
    )]
    pub upload_root: String,
    #[arg(
        long,
        env = "SYSTEM_DIRS",
        value_delimiter = ',',
        default_values_t = DEFAULT_SYSTEM_DIRS.iter().map(|dir| dir.to_string()),
        help = "Comma separated top level directories that are never served"
    )]
    pub system_dirs: Vec<String>,
    #[arg(
        long,
        env = "META_STORE_SERVICE",
        default_value = DEFAULT_META_STORE_URL,
        help = "Metadata service base URL"
    )]
    pub meta_store_url: String,
    #[arg(long, env = "RECORD_STORE_SERVICE", help = "Record service base URL")]
    pub record_store_url: Option<String>,
    #[arg(long, env = "PERMISSION_SERVICE", help = "Permission service base URL")]
    pub permission_url: Option<String>,
    #[arg(
        long,
        env = "API_IGNORE_PERMISSION_CHECK",
        action = clap::ArgAction::SetTrue,
        value_parser = BoolishValueParser::new(),
        help = "Skip permission checks (development only)"
    )]
    pub ignore_permission_check: bool,
    #[arg(
        long,
        env = "CORS_ORIGINS",
        default_value = "*",
        help = "Comma separated CORS origins, `*` allows any origin"
    )]
    pub cors_origins: String,
}

impl Args {
    /// Previous signing keys needed so that no token outlives its key:
    /// `--key-history`, raised to cover the token lifetime plus leeway.
    pub fn effective_key_history(&self) -> usize {
        let span = self.jwt_lifetime.saturating_add(self.token_leeway_secs);
        let needed = span.div_ceil(self.key_rotation_secs.max(1));
        self.key_history.max(usize::try_from(needed).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::try_parse_from(["file-provider"]).expect("parse");
        assert_eq!(args.port, 8080);
        assert_eq!(args.jwt_lifetime, DEFAULT_JWT_LIFETIME_SECS);
        assert_eq!(args.key_history, 1);
        assert_eq!(args.upload_root, DEFAULT_UPLOAD_ROOT);
        assert_eq!(args.system_dirs.len(), DEFAULT_SYSTEM_DIRS.len());
        assert!(!args.system_dirs.iter().any(|dir| dir == "opt"));
        assert_eq!(args.cors_origins, "*");
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "file-provider",
            "--port",
            "9000",
            "--system-dirs",
            "etc,proc",
            "--ignore-permission-check",
            "--permission-url",
            "http://perm:8000",
        ])
        .expect("parse");
        assert_eq!(args.port, 9000);
        assert_eq!(args.system_dirs, vec!["etc".to_string(), "proc".to_string()]);
        assert!(args.ignore_permission_check);
        assert_eq!(args.permission_url.as_deref(), Some("http://perm:8000"));
    }

    #[test]
    fn key_history_covers_token_lifetime() {
        let args = Args::try_parse_from(["file-provider"]).expect("parse");
        assert_eq!(args.effective_key_history(), 1);

        let args =
            Args::try_parse_from(["file-provider", "--key-rotation-secs", "60"]).expect("parse");
        assert_eq!(args.effective_key_history(), 60);

        let args = Args::try_parse_from([
            "file-provider",
            "--key-rotation-secs",
            "60",
            "--token-leeway-secs",
            "30",
        ])
        .expect("parse");
        assert_eq!(args.effective_key_history(), 61);

        let args = Args::try_parse_from(["file-provider", "--key-history", "5"]).expect("parse");
        assert_eq!(args.effective_key_history(), 5);
    }

    #[test]
    fn zero_lifetime_is_rejected() {
        assert!(Args::try_parse_from(["file-provider", "--jwt-lifetime", "0"]).is_err());
    }
}
