//! Volume Operations Service, Device Correlator, and State Recovery — the
//! orchestration layer gluing the cloud client, device monitor,
//! persistent-name layer, NBD export manager, and repository together
//! behind keyed per-volume/per-VM locking.

pub mod correlator;
pub mod locks;
pub mod recovery;
#[cfg(test)]
mod test_support;
pub mod volume_ops;

pub use correlator::{CorrelationCandidate, CorrelationConfig, CorrelationError, CorrelationExpectation};
pub use locks::VolumeLocks;
pub use recovery::{RecoveryCounters, RecoveryResult, StateRecovery};
pub use volume_ops::{VolumeOperationsService, VolumeOperationsServiceConfig};
