//! Distributor configuration.
//!
//! [`DistributorParams::default`] is pure; environment overrides are an
//! explicit opt-in through [`DistributorParams::from_env`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::distributor_error::DistributorError;

/// How the exchange engine posts its sends.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendType {
    /// Non-blocking sends, completed in `do_waits`.
    #[serde(alias = "Isend")]
    Immediate,
    /// Blocking ready-mode sends; the receive must already be posted.
    #[serde(alias = "Rsend")]
    Ready,
    /// Blocking standard-mode sends.
    #[default]
    #[serde(alias = "Send")]
    Standard,
    /// Blocking synchronous-mode sends.
    #[serde(alias = "Ssend")]
    Synchronous,
}

impl SendType {
    pub const ALL: [SendType; 4] = [
        SendType::Immediate,
        SendType::Ready,
        SendType::Standard,
        SendType::Synchronous,
    ];

    /// Conventional MPI spelling of the send mode.
    pub fn as_str(self) -> &'static str {
        match self {
            SendType::Immediate => "Isend",
            SendType::Ready => "Rsend",
            SendType::Standard => "Send",
            SendType::Synchronous => "Ssend",
        }
    }
}

impl fmt::Display for SendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendType {
    type Err = DistributorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Isend" | "Immediate" => Ok(SendType::Immediate),
            "Rsend" | "Ready" => Ok(SendType::Ready),
            "Send" | "Standard" => Ok(SendType::Standard),
            "Ssend" | "Synchronous" => Ok(SendType::Synchronous),
            other => Err(DistributorError::UnknownSendType(other.to_string())),
        }
    }
}

pub const ENV_SEND_TYPE: &str = "MESH_DISTRIBUTOR_SEND_TYPE";
pub const ENV_BARRIER: &str = "MESH_DISTRIBUTOR_BARRIER";
pub const ENV_DISTINCT_TAGS: &str = "MESH_DISTRIBUTOR_DISTINCT_TAGS";
pub const ENV_DEBUG: &str = "MESH_DISTRIBUTOR_DEBUG";
pub const ENV_PRINT_THRESHOLD: &str = "MESH_DISTRIBUTOR_PRINT_THRESHOLD";

/// Default cap on how many offending entries an error message lists.
pub const DEFAULT_PRINT_THRESHOLD: usize = 200;

/// Options controlling how a [`Distributor`](super::Distributor) exchanges data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorParams {
    pub send_type: SendType,
    /// `None` follows the send type: a barrier is used exactly for ready sends.
    pub barrier_between_recv_send: Option<bool>,
    /// Give forward and reverse exchanges non-overlapping message tags.
    pub use_distinct_tags: bool,
    pub debug: bool,
    /// Max number of offending entries listed in error and debug output.
    pub print_threshold: usize,
}

impl Default for DistributorParams {
    fn default() -> Self {
        Self {
            send_type: SendType::Standard,
            barrier_between_recv_send: None,
            use_distinct_tags: true,
            debug: false,
            print_threshold: DEFAULT_PRINT_THRESHOLD,
        }
    }
}

impl DistributorParams {
    pub fn with_send_type(mut self, send_type: SendType) -> Self {
        self.send_type = send_type;
        self
    }

    pub fn with_barrier(mut self, barrier: bool) -> Self {
        self.barrier_between_recv_send = Some(barrier);
        self
    }

    pub fn with_distinct_tags(mut self, distinct: bool) -> Self {
        self.use_distinct_tags = distinct;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_print_threshold(mut self, threshold: usize) -> Self {
        self.print_threshold = threshold;
        self
    }

    /// Effective barrier setting.
    pub fn barrier_between_recv_send(&self) -> bool {
        self.barrier_between_recv_send
            .unwrap_or(self.send_type == SendType::Ready)
    }

    /// Reject combinations that cannot work before any communication happens.
    pub fn validate(&self) -> Result<(), DistributorError> {
        if self.send_type == SendType::Ready && !self.barrier_between_recv_send() {
            return Err(DistributorError::ReadyWithoutBarrier);
        }
        Ok(())
    }

    /// Defaults overlaid with the `MESH_DISTRIBUTOR_*` environment variables.
    pub fn from_env() -> Result<Self, DistributorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for the
    /// `MESH_DISTRIBUTOR_*` keys. The result is validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DistributorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut params = Self::default();
        if let Some(v) = lookup(ENV_SEND_TYPE) {
            params.send_type = v.parse()?;
        }
        if let Some(v) = lookup(ENV_BARRIER) {
            params.barrier_between_recv_send = Some(parse_flag(ENV_BARRIER, &v)?);
        }
        if let Some(v) = lookup(ENV_DISTINCT_TAGS) {
            params.use_distinct_tags = parse_flag(ENV_DISTINCT_TAGS, &v)?;
        }
        if let Some(v) = lookup(ENV_DEBUG) {
            params.debug = parse_flag(ENV_DEBUG, &v)?;
        }
        if let Some(v) = lookup(ENV_PRINT_THRESHOLD) {
            params.print_threshold =
                v.trim()
                    .parse()
                    .map_err(|_| DistributorError::InvalidOption {
                        key: ENV_PRINT_THRESHOLD.to_string(),
                        value: v.clone(),
                    })?;
        }
        params.validate()?;
        Ok(params)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, DistributorError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DistributorError::InvalidOption {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_type_names() {
        for st in SendType::ALL {
            assert_eq!(st.as_str().parse::<SendType>().unwrap(), st);
            assert_eq!(format!("{st:?}").parse::<SendType>().unwrap(), st);
        }
        assert!(matches!(
            "Bsend".parse::<SendType>(),
            Err(DistributorError::UnknownSendType(s)) if s == "Bsend"
        ));
    }

    #[test]
    fn barrier_follows_send_type_unless_set() {
        let p = DistributorParams::default().with_send_type(SendType::Ready);
        assert!(p.barrier_between_recv_send());
        assert!(p.validate().is_ok());
        assert!(!DistributorParams::default().barrier_between_recv_send());
        let p = DistributorParams::default().with_barrier(true);
        assert!(p.barrier_between_recv_send());
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag("k", " Yes ").unwrap());
        assert!(!parse_flag("k", "0").unwrap());
        assert!(parse_flag("k", "maybe").is_err());
    }
}
