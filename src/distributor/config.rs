//! Named options of a [`Distributor`](super::Distributor).
//!
//! The option names are the ones used in parameter lists:
//!
//! | name                                   | values                                 | default  |
//! |----------------------------------------|----------------------------------------|----------|
//! | `"Send type"`                          | `"Send"`, `"Isend"`, `"Rsend"`, `"Ssend"` | `"Send"` |
//! | `"Barrier between receives and sends"` | `true` / `false`                       | `false`  |
//! | `"Use distinct tags"`                  | `true` / `false`                       | `true`   |
//! | `"Debug"`                              | `true` / `false`                       | `false`  |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dist_error::DistributorError;

pub const SEND_TYPE: &str = "Send type";
pub const BARRIER: &str = "Barrier between receives and sends";
pub const DISTINCT_TAGS: &str = "Use distinct tags";
pub const DEBUG: &str = "Debug";

/// Send primitive used when posting a plan's messages.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendType {
    /// Blocking standard send.
    #[default]
    Send,
    /// Non-blocking send, completed in `wait`.
    Isend,
    /// Ready send; the matching receive must already be posted.
    Rsend,
    /// Synchronous send; blocks until the receive is matched.
    Ssend,
}

impl SendType {
    pub const ALL: [SendType; 4] = [Self::Send, Self::Isend, Self::Rsend, Self::Ssend];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Isend => "Isend",
            Self::Rsend => "Rsend",
            Self::Ssend => "Ssend",
        }
    }

    /// Whether posting leaves send handles to be completed in `wait`.
    pub fn is_immediate(self) -> bool {
        matches!(self, Self::Isend)
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
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                DistributorError::InvalidConfig(format!(
                    "\"{SEND_TYPE}\" must be one of Send, Isend, Rsend, Ssend (got \"{s}\")"
                ))
            })
    }
}

/// Copy-valued knobs of a plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    #[serde(rename = "Send type")]
    pub send_type: SendType,
    #[serde(rename = "Barrier between receives and sends")]
    pub barrier_between_recvs_and_sends: bool,
    #[serde(rename = "Use distinct tags")]
    pub use_distinct_tags: bool,
    #[serde(rename = "Debug")]
    pub debug: bool,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            send_type: SendType::Send,
            barrier_between_recvs_and_sends: false,
            use_distinct_tags: true,
            debug: false,
        }
    }
}

impl DistributorConfig {
    /// Select the send primitive; `Rsend` switches the barrier on.
    pub fn with_send_type(mut self, send_type: SendType) -> Self {
        self.send_type = send_type;
        if send_type == SendType::Rsend {
            self.barrier_between_recvs_and_sends = true;
        }
        self
    }

    pub fn with_barrier(mut self, on: bool) -> Self {
        self.barrier_between_recvs_and_sends = on;
        self
    }

    pub fn with_distinct_tags(mut self, on: bool) -> Self {
        self.use_distinct_tags = on;
        self
    }

    pub fn with_debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    /// Apply one named option.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), DistributorError> {
        match name {
            SEND_TYPE => {
                *self = self.clone().with_send_type(value.parse()?);
            }
            BARRIER => self.barrier_between_recvs_and_sends = parse_bool(name, value)?,
            DISTINCT_TAGS => self.use_distinct_tags = parse_bool(name, value)?,
            DEBUG => self.debug = parse_bool(name, value)?,
            other => {
                return Err(DistributorError::InvalidConfig(format!(
                    "unknown option \"{other}\""
                )));
            }
        }
        Ok(())
    }

    /// Build a config from `(name, value)` pairs applied in order.
    pub fn from_params<'a, I>(params: I) -> Result<Self, DistributorError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut cfg = Self::default();
        for (name, value) in params {
            cfg.set(name, value)?;
        }
        Ok(cfg)
    }

    /// Checked when an exchange is posted, not when the plan is built.
    pub fn validate(&self) -> Result<(), DistributorError> {
        if self.send_type == SendType::Rsend && !self.barrier_between_recvs_and_sends {
            return Err(DistributorError::ReadySendWithoutBarrier);
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, DistributorError> {
    value.trim().parse::<bool>().map_err(|_| {
        DistributorError::InvalidConfig(format!("\"{name}\" expects true or false (got \"{value}\")"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = DistributorConfig::default();
        assert_eq!(cfg.send_type, SendType::Send);
        assert!(!cfg.barrier_between_recvs_and_sends);
        assert!(cfg.use_distinct_tags);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rsend_forces_barrier() {
        let cfg = DistributorConfig::from_params([(SEND_TYPE, "Rsend")]).unwrap();
        assert!(cfg.barrier_between_recvs_and_sends);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rsend_without_barrier_fails_validation() {
        let cfg = DistributorConfig::from_params([(SEND_TYPE, "Rsend"), (BARRIER, "false")]).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(DistributorError::ReadySendWithoutBarrier)
        ));
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut cfg = DistributorConfig::default();
        assert!(cfg.set(SEND_TYPE, "Bsend").is_err());
        assert!(cfg.set(DEBUG, "yes").is_err());
        assert!(cfg.set("Send Type", "Send").is_err());
        assert_eq!(cfg, DistributorConfig::default());
    }

    #[test]
    fn send_type_names_roundtrip() {
        for t in SendType::ALL {
            assert_eq!(t.as_str().parse::<SendType>().unwrap(), t);
        }
    }
}
