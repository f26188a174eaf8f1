use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "coldchain-alerts",
    version,
    about = "Cold-chain temperature alerting over MQTT"
)]
pub struct Args {
    /// JSON overrides file. Falls back to COLDCHAIN_CONFIG_PATH; environment variables win.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Validate configuration, print the effective thresholds and exit.
    #[arg(long, default_value_t = false)]
    pub check_config: bool,
}
