//! Device Correlator
//!
//! Binds a just-created kernel block device to the operation that caused
//! it. Pure function over `(candidates, excluded_paths, expectation,
//! config)` — no I/O, so it's exercised entirely by unit tests.

use thiserror::Error;
use volcore_device::DeviceInfo;

pub const DEFAULT_SIZE_TOLERANCE_BYTES: u64 = 3 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct CorrelationConfig {
    pub size_tolerance_bytes: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            size_tolerance_bytes: DEFAULT_SIZE_TOLERANCE_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationCandidate {
    pub info: DeviceInfo,
    pub added_at: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CorrelationExpectation {
    pub expected_size_bytes: u64,
    pub cloudstack_device_id: Option<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("no new devices to correlate against")]
    NoCandidate,
    #[error("no device within size tolerance of the expected volume size")]
    NoSizeMatch,
    #[error("multiple devices tied for correlation, refusing to guess")]
    AmbiguousTie,
}

fn size_within_tolerance(actual: u64, expected: u64, tolerance: u64) -> bool {
    actual.abs_diff(expected) <= tolerance
}

/// `0 -> /dev/vda`, `1 -> /dev/vdb`, ... Only defined for ordinals < 26
/// (single kernel letter); CloudStack has never assigned more virtio
/// slots than that in practice, so beyond it we simply don't have an
/// ordinal hint to apply.
fn ordinal_to_path(ordinal: u32) -> Option<String> {
    if ordinal < 26 {
        let letter = (b'a' + u8::try_from(ordinal).ok()?) as char;
        Some(format!("/dev/vd{letter}"))
    } else {
        None
    }
}

/// Applies the match predicate in order: size-with-tolerance, cloud
/// device ordinal, temporal proximity. A candidate whose path is in
/// `excluded_paths` (already has a mapping row) is never considered.
pub fn correlate(
    candidates: &[CorrelationCandidate],
    excluded_paths: &std::collections::HashSet<String>,
    expectation: &CorrelationExpectation,
    config: &CorrelationConfig,
) -> Result<DeviceInfo, CorrelationError> {
    let pool: Vec<&CorrelationCandidate> = candidates
        .iter()
        .filter(|c| !excluded_paths.contains(&c.info.path))
        .collect();
    if pool.is_empty() {
        return Err(CorrelationError::NoCandidate);
    }

    let mut remaining: Vec<&CorrelationCandidate> = pool
        .into_iter()
        .filter(|c| size_within_tolerance(c.info.size, expectation.expected_size_bytes, config.size_tolerance_bytes))
        .collect();
    if remaining.is_empty() {
        return Err(CorrelationError::NoSizeMatch);
    }
    if remaining.len() == 1 {
        return Ok(remaining[0].info.clone());
    }

    if let Some(ordinal) = expectation.cloudstack_device_id {
        if let Some(expected_path) = ordinal_to_path(ordinal) {
            if let Some(pos) = remaining.iter().position(|c| c.info.path == expected_path) {
                return Ok(remaining[pos].info.clone());
            }
        }
    }

    remaining.sort_by_key(|c| std::cmp::Reverse(c.added_at));
    let newest = remaining[0].added_at;
    let tied: Vec<&&CorrelationCandidate> = remaining.iter().filter(|c| c.added_at == newest).collect();
    match tied.len() {
        1 => Ok(tied[0].info.clone()),
        _ => Err(CorrelationError::AmbiguousTie),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(path: &str, size: u64) -> DeviceInfo {
        DeviceInfo {
            path: path.to_string(),
            size,
            controller: "virtio".to_string(),
        }
    }

    fn candidate(path: &str, size: u64, added_at: u64) -> CorrelationCandidate {
        CorrelationCandidate {
            info: device(path, size),
            added_at,
        }
    }

    #[test]
    fn single_size_match_wins() {
        let candidates = vec![candidate("/dev/vdb", 10 * 1024 * 1024 * 1024, 100)];
        let result = correlate(
            &candidates,
            &Default::default(),
            &CorrelationExpectation { expected_size_bytes: 10 * 1024 * 1024 * 1024, cloudstack_device_id: None },
            &CorrelationConfig::default(),
        )
        .unwrap();
        assert_eq!(result.path, "/dev/vdb");
    }

    #[test]
    fn two_same_size_candidates_without_ordinal_or_distinct_time_must_fail() {
        let candidates = vec![
            candidate("/dev/vdb", 10 * 1024 * 1024 * 1024, 100),
            candidate("/dev/vdc", 10 * 1024 * 1024 * 1024, 100),
        ];
        let err = correlate(
            &candidates,
            &Default::default(),
            &CorrelationExpectation { expected_size_bytes: 10 * 1024 * 1024 * 1024, cloudstack_device_id: None },
            &CorrelationConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, CorrelationError::AmbiguousTie);
    }

    #[test]
    fn ordinal_breaks_size_tie() {
        let candidates = vec![
            candidate("/dev/vdb", 10 * 1024 * 1024 * 1024, 100),
            candidate("/dev/vdc", 10 * 1024 * 1024 * 1024, 200),
        ];
        let result = correlate(
            &candidates,
            &Default::default(),
            &CorrelationExpectation { expected_size_bytes: 10 * 1024 * 1024 * 1024, cloudstack_device_id: Some(2) },
            &CorrelationConfig::default(),
        )
        .unwrap();
        assert_eq!(result.path, "/dev/vdc");
    }

    #[test]
    fn temporal_proximity_breaks_tie_when_ordinal_does_not_apply() {
        let candidates = vec![
            candidate("/dev/vdb", 10 * 1024 * 1024 * 1024, 100),
            candidate("/dev/vdc", 10 * 1024 * 1024 * 1024, 200),
        ];
        let result = correlate(
            &candidates,
            &Default::default(),
            &CorrelationExpectation { expected_size_bytes: 10 * 1024 * 1024 * 1024, cloudstack_device_id: None },
            &CorrelationConfig::default(),
        )
        .unwrap();
        assert_eq!(result.path, "/dev/vdc");
    }

    #[test]
    fn already_mapped_path_is_excluded() {
        let candidates = vec![candidate("/dev/vdb", 10 * 1024 * 1024 * 1024, 100)];
        let mut excluded = std::collections::HashSet::new();
        excluded.insert("/dev/vdb".to_string());
        let err = correlate(
            &candidates,
            &excluded,
            &CorrelationExpectation { expected_size_bytes: 10 * 1024 * 1024 * 1024, cloudstack_device_id: None },
            &CorrelationConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, CorrelationError::NoCandidate);
    }

    #[test]
    fn size_outside_tolerance_fails() {
        let candidates = vec![candidate("/dev/vdb", 20 * 1024 * 1024 * 1024, 100)];
        let err = correlate(
            &candidates,
            &Default::default(),
            &CorrelationExpectation { expected_size_bytes: 10 * 1024 * 1024 * 1024, cloudstack_device_id: None },
            &CorrelationConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, CorrelationError::NoSizeMatch);
    }
}
