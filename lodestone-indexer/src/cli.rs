use std::{num::NonZeroUsize, time::Duration};

use clap::Parser;

use crate::sync::{BackoffPolicy, SyncOpts};

/// Lodestone Indexer
///
/// Keeps a local index of a chain daemon's block headers current and serves
/// sync status to clients once caught up.
#[derive(Parser, PartialEq, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Chain daemon JSON-RPC endpoint
    #[clap(env = "DAEMON_RPC_URL", long, hide_env_values = true)]
    pub daemon_url: String,

    /// Directory holding the indexed header store
    #[clap(long, env = "LODESTONE_DATA_DIR", default_value = "./lodestone-data")]
    pub data_dir: String,

    /// The server IP
    #[clap(long, default_value = "0.0.0.0")]
    pub server_ip: String,

    /// The status server port
    #[clap(long, default_value = "8099")]
    pub server_port: u16,

    /// The Prometheus metrics port
    #[clap(long, default_value = "9184")]
    pub metrics_port: u16,

    /// How often to poll the daemon for new headers, in milliseconds
    #[clap(long, default_value = "5000")]
    pub poll_interval_ms: u64,

    /// Maximum number of concurrent header download tasks
    #[clap(long, default_value = "4")]
    pub max_sync_tasks: usize,

    /// Headers requested from the daemon per RPC call
    #[clap(long, default_value = "2000")]
    pub headers_batch_size: u64,

    /// Grace period for outstanding tasks at shutdown, in milliseconds
    #[clap(long, default_value = "10000")]
    pub shutdown_grace_ms: u64,

    /// Initial retry backoff after a failed attempt, in milliseconds
    #[clap(long, default_value = "1000")]
    pub backoff_base_ms: u64,

    /// Upper bound on the retry backoff, in milliseconds
    #[clap(long, default_value = "60000")]
    pub backoff_cap_ms: u64,
}

impl Cli {
    pub fn sync_opts(&self) -> Result<SyncOpts, String> {
        let max_tasks = NonZeroUsize::new(self.max_sync_tasks)
            .ok_or("--max-sync-tasks must be at least 1")?;
        Ok(SyncOpts {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_tasks,
            headers_batch: self.headers_batch_size,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                cap: Duration::from_millis(self.backoff_cap_ms),
            },
        })
    }
}
