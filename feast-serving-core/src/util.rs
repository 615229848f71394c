use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prost_types::Timestamp as ProstTimestamp;

pub(crate) fn read_file_to_bytes(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read file {}", path))
}

pub fn prost_timestamp_to_datetime(prost_timestamp: &ProstTimestamp) -> DateTime<Utc> {
    let seconds = prost_timestamp.seconds.max(0);
    let nanos = prost_timestamp.nanos.max(0) as u32;
    DateTime::<Utc>::from_timestamp(seconds, nanos).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn datetime_to_prost_timestamp(dt: DateTime<Utc>) -> ProstTimestamp {
    ProstTimestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}
