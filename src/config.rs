//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const CHUNK_DIR_NAME: &str = ".chunks";
pub const KEY_DELIMITER: char = '-';
pub const MAX_FILENAME_LEN: usize = 255;
pub const MAX_HASH_LEN: usize = 128;
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_UPLOAD_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const UPLOAD_CLEAN_INTERVAL_SECS: u64 = 900;
pub const BUSY_RETRY_AFTER_SECS: u64 = 3;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-stitch", version = VERSION_INFO, about = "AxoStitch chunked upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = ".axo/resources",
        help = "Directory for chunks and merged files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_HTTP_PORT",
        default_value_t = 3001,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        long,
        env = "AXO_CORS_ORIGINS",
        help = "Comma separated CORS origins, or * for any"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max bytes per chunk (0 to disable)"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_TEMP_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_TEMP_TTL_SECS,
        help = "Unmerged upload cleanup threshold in seconds (0 to disable)"
    )]
    pub upload_temp_ttl_secs: u64,
}
