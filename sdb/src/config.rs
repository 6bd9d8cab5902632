//! Receiver configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::topology::CpuConfig;

/// Device file exposed by the rpmsg-sdb kernel module.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/rpmsg-sdb";

/// How long a `Ready` receiver parks before re-checking its state.
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(50);

/// Silence after which the receiver logs that no buffer arrived.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Granularity of a `Sampling` wait between state checks.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Whether byte counters survive a stop/start cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CounterPolicy {
    /// Counters accumulate until the receiver is de-initialized.
    #[default]
    Cumulative,
    /// Counters are cleared every time sampling starts.
    ResetOnStart,
}

/// Configuration for a [`Receiver`](crate::Receiver).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Character device opened by [`Receiver::init_device`](crate::Receiver::init_device).
    pub device_path: PathBuf,
    /// Upper bound on a parked wait while the receiver is `Ready`.
    #[serde(with = "millis")]
    pub idle_poll: Duration,
    /// Silence on the awaited slot after which a timeout is logged and counted.
    #[serde(with = "millis")]
    pub notify_timeout: Duration,
    /// How often a `Sampling` wait wakes to observe stop/exit requests.
    #[serde(with = "millis")]
    pub wait_slice: Duration,
    /// Callbacks running longer than this are reported.
    #[serde(with = "opt_millis")]
    pub callback_budget: Option<Duration>,
    /// Counter behavior across stop/start cycles.
    pub counters: CounterPolicy,
    /// CPU pinning for the receiver thread.
    pub cpu: CpuConfig,
    /// Name given to the receiver thread.
    pub thread_name: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            idle_poll: DEFAULT_IDLE_POLL,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            wait_slice: DEFAULT_WAIT_SLICE,
            callback_budget: None,
            counters: CounterPolicy::default(),
            cpu: CpuConfig::default(),
            thread_name: "sdb-receiver".into(),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
