use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sikreg", version, about = "Register a polling-station section and confirm its test stream")]
pub struct Cli {
    #[arg(long, global = true, help = "Config file (default: platform config dir)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Write logs to this file instead of stderr")]
    pub log_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Keep credentials in memory only")]
    pub ephemeral: bool,

    #[arg(long, global = true, help = "Output machine-readable JSON")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register the section encoded in a QR payload ("-" reads stdin)
    Register {
        qr: String,
        #[arg(long, help = "Wait for the test stream to be confirmed afterwards")]
        check: bool,
    },
    /// Poll the backend until it confirms the test stream
    Check {
        #[arg(long, default_value = "test-setup")]
        mode: String,
        #[arg(long, help = "UDI to check (default: stored UDI)")]
        udi: Option<String>,
    },
    /// Ask for a fresh stream endpoint until one is handed out
    Relogin { qr: String },
    /// Encrypt a QR payload with a key (default: the stored keyenc)
    Seal {
        json: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Print a fresh random key, base64
    Keygen,
    /// Show stored credentials
    Show,
}
