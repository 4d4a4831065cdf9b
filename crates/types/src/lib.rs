mod devnet;
mod record;
mod tracing;

pub use devnet::{
    DEFAULT_CONTAINER_GID, DEFAULT_CONTAINER_UID, DEFAULT_DEVNET_CHAIN_ID, DEFAULT_DEVNET_HOST,
    DEFAULT_GENESIS_IDENTITIES, DEFAULT_LAUNCH_TIMEOUT_SECS, DEFAULT_POST_LAUNCH_WAIT_SECS,
    DEFAULT_READY_POLL_INTERVAL_MS, DEFAULT_STATE_PARENT_DIR, DevnetBackend, DevnetConfig,
    DevnetConfigError, DevnetPlatform, PortMode,
};
pub use record::{DevnetRecord, RecordPort};
pub use tracing::init_tracing;
