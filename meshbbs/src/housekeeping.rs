//! Backup and message-age expiry are named out-of-scope external
//! collaborators (spec §1): the scheduler drives them on a tick, but this
//! crate only owns the trait boundary, not a real implementation.

use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait Housekeeping: Send + Sync {
    async fn backup(&self) {}
    async fn expire_old_messages(&self) {}
}

/// Default no-op implementation. A real deployment supplies its own.
pub struct NullHousekeeping;

#[async_trait]
impl Housekeeping for NullHousekeeping {
    async fn backup(&self) {
        debug!("housekeeping: backup tick (no-op)");
    }

    async fn expire_old_messages(&self) {
        debug!("housekeeping: message-age expiry tick (no-op)");
    }
}
