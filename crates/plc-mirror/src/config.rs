//! Command-line configuration, each option also readable from the
//! environment under a `PLCMIRROR_` prefix.

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "plc-mirror")]
#[command(about = "Mirrors the PLC directory's operation log into an embedded store", long_about = None)]
pub struct Config {
    /// Address the mirror's query surface listens on
    #[arg(long, env = "PLCMIRROR_LISTEN_ADDR", default_value = "0.0.0.0:8082")]
    pub listen_addr: String,

    /// Upstream PLC directory host to page through
    #[arg(long, env = "PLCMIRROR_PLC_HOST", default_value = "https://plc.directory")]
    pub plc_host: String,

    /// Directory holding the embedded SQLite database file
    #[arg(long, env = "PLCMIRROR_DATA_DIR", default_value = ".")]
    pub data_dir: String,

    /// Poll interval once the paginator catches up to the head of the log, in seconds
    #[arg(long, env = "PLCMIRROR_CHECK_INTERVAL", default_value = "5")]
    pub check_interval_secs: u64,

    /// Page size requested from the directory's export endpoint
    #[arg(long, env = "PLCMIRROR_PAGE_SIZE", default_value = "1000")]
    pub page_size: u32,

    /// Enable debug-level logging
    #[arg(long, env = "PLCMIRROR_DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Config {
    pub fn sqlite_path(&self) -> String {
        format!("{}/plc-mirror.sqlite3", self.data_dir.trim_end_matches('/'))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}
