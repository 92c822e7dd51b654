//! Storage key derivation for segment payloads.
//!
//! Keys are `{flow_id}/{YYYY}/{MM}/{DD}/{segment_id}`, partitioned by the
//! calendar date of the timerange start. The derived key is persisted with
//! the segment and becomes the blob's permanent address, so this format
//! must not change without migrating existing blobs.

use crate::models::timerange::TimeRange;
use chrono::DateTime;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("timerange `{0}` has no start to partition the storage key by")]
    UnboundedStart(String),
    #[error("timerange `{0}` starts outside the representable calendar")]
    OutOfRange(String),
}

/// Derive the blob key for a segment.
///
/// Pure and deterministic: the same inputs always give the same key. Ranges
/// without a start are refused instead of being partitioned by wall-clock
/// time.
pub fn derive_key(
    flow_id: Uuid,
    segment_id: &str,
    timerange: &TimeRange,
) -> Result<String, KeyError> {
    let start = timerange
        .start()
        .ok_or_else(|| KeyError::UnboundedStart(timerange.to_string()))?;

    let date = i64::try_from(start.seconds())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, start.subsec_nanos()))
        .ok_or_else(|| KeyError::OutOfRange(timerange.to_string()))?;

    Ok(format!(
        "{}/{}/{}",
        flow_id,
        date.format("%Y/%m/%d"),
        segment_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> Uuid {
        Uuid::parse_str("6f1d2c2e-7f1c-4c55-9d6f-2b1f3c4d5e6f").unwrap()
    }

    #[test]
    fn partitions_by_start_date() {
        let range = TimeRange::parse("[1700000000:0_1700000010:0)").unwrap();
        assert_eq!(
            derive_key(flow(), "seg-1", &range).unwrap(),
            "6f1d2c2e-7f1c-4c55-9d6f-2b1f3c4d5e6f/2023/11/14/seg-1"
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let range = TimeRange::parse("(86399:999999999_)").unwrap();
        let first = derive_key(flow(), "s", &range).unwrap();
        let second = derive_key(flow(), "s", &range).unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with("/1970/01/01/s"));
    }

    #[test]
    fn pre_epoch_starts_fall_on_the_previous_day() {
        let range = TimeRange::parse("-0:1").unwrap();
        assert!(derive_key(flow(), "s", &range).unwrap().ends_with("/1969/12/31/s"));
    }

    #[test]
    fn unbounded_start_is_refused() {
        for raw in ["_", "(_10:0)"] {
            let range = TimeRange::parse(raw).unwrap();
            assert!(matches!(
                derive_key(flow(), "s", &range),
                Err(KeyError::UnboundedStart(_))
            ));
        }
    }

    #[test]
    fn far_future_start_is_out_of_range() {
        let range = TimeRange::parse("999999999999999999:0").unwrap();
        assert!(matches!(
            derive_key(flow(), "s", &range),
            Err(KeyError::OutOfRange(_))
        ));
    }
}
