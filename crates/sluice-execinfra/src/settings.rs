use std::time::Duration;

use error_stack::{IntoReport, ResultExt};

use crate::Error;

const MIB: u64 = 1 << 20;

/// Cluster settings read by the flow runtime.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How long a registered flow waits for its inbound streams to connect.
    #[serde(with = "humantime_duration")]
    pub flow_stream_timeout: Duration,
    /// Memory budget of a single router output before it spills to disk.
    pub work_mem_bytes: u64,
    /// Bytes of index-backfill entries buffered before spilling.
    pub backfiller_buffer_size: u64,
    /// Target size of sorted files ingested during backfills.
    pub backfiller_max_sst_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            flow_stream_timeout: Duration::from_secs(10),
            work_mem_bytes: 64 * MIB,
            backfiller_buffer_size: 196 * MIB,
            backfiller_max_sst_size: 16 * MIB,
        }
    }
}

impl Settings {
    pub const FLOW_STREAM_TIMEOUT: &'static str = "sql.distsql.flow_stream_timeout";
    pub const WORK_MEM: &'static str = "sql.distsql.temp_storage.workmem";
    pub const BACKFILLER_BUFFER_SIZE: &'static str = "schemachanger.backfiller.buffer_size";
    pub const BACKFILLER_MAX_SST_SIZE: &'static str = "schemachanger.backfiller.max_sst_size";

    /// Sets a setting by name from its string form.
    ///
    /// Durations use the `humantime` syntax (`10s`, `1m 30s`). Byte sizes are
    /// an integer with an optional `KiB`, `MiB` or `GiB` suffix.
    pub fn set(&mut self, name: &str, value: &str) -> error_stack::Result<(), Error> {
        let invalid = || Error::InvalidSetting {
            name: name.to_owned(),
            value: value.to_owned(),
        };
        match name {
            Self::FLOW_STREAM_TIMEOUT | "flow_stream_timeout" => {
                self.flow_stream_timeout = humantime::parse_duration(value.trim())
                    .into_report()
                    .change_context_lazy(invalid)?;
            }
            Self::WORK_MEM => {
                self.work_mem_bytes = parse_bytes(value).ok_or_else(invalid)?;
            }
            Self::BACKFILLER_BUFFER_SIZE => {
                self.backfiller_buffer_size = parse_bytes(value).ok_or_else(invalid)?;
            }
            Self::BACKFILLER_MAX_SST_SIZE => {
                self.backfiller_max_sst_size = parse_bytes(value).ok_or_else(invalid)?;
            }
            _ => error_stack::bail!(Error::UnknownSetting(name.to_owned())),
        }
        tracing::info!("Set {name} = {value}");
        Ok(())
    }

    /// The current value of a setting in its string form.
    pub fn get(&self, name: &str) -> Option<String> {
        match name {
            Self::FLOW_STREAM_TIMEOUT | "flow_stream_timeout" => {
                Some(humantime::format_duration(self.flow_stream_timeout).to_string())
            }
            Self::WORK_MEM => Some(self.work_mem_bytes.to_string()),
            Self::BACKFILLER_BUFFER_SIZE => Some(self.backfiller_buffer_size.to_string()),
            Self::BACKFILLER_MAX_SST_SIZE => Some(self.backfiller_max_sst_size.to_string()),
            _ => None,
        }
    }
}

fn parse_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = [("GiB", 1 << 30), ("MiB", MIB), ("KiB", 1 << 10), ("B", 1)]
        .into_iter()
        .find_map(|(suffix, multiplier)| {
            value
                .strip_suffix(suffix)
                .map(|digits| (digits.trim(), multiplier))
        })
        .unwrap_or((value, 1));
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}
