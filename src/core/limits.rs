//! Store limits with per-channel overrides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LimitsError {
    #[error("limit {name} cannot be negative (got {value})")]
    Negative { name: &'static str, value: i64 },
    #[error("override for unknown-style channel name {0:?}")]
    BadOverrideName(String),
}

/// Per-channel caps. 0 means unlimited; in an override, 0 inherits the
/// global value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelLimits {
    pub max_subscriptions: i64,
    pub max_msgs: i64,
    pub max_bytes: i64,
    pub max_age_ns: i64,
}

impl ChannelLimits {
    fn validate(&self) -> Result<(), LimitsError> {
        for (name, value) in [
            ("max_subscriptions", self.max_subscriptions),
            ("max_msgs", self.max_msgs),
            ("max_bytes", self.max_bytes),
            ("max_age_ns", self.max_age_ns),
        ] {
            if value < 0 {
                return Err(LimitsError::Negative { name, value });
            }
        }
        Ok(())
    }

    fn merged_over(&self, base: &ChannelLimits) -> ChannelLimits {
        let pick = |ours: i64, theirs: i64| if ours != 0 { ours } else { theirs };
        ChannelLimits {
            max_subscriptions: pick(self.max_subscriptions, base.max_subscriptions),
            max_msgs: pick(self.max_msgs, base.max_msgs),
            max_bytes: pick(self.max_bytes, base.max_bytes),
            max_age_ns: pick(self.max_age_ns, base.max_age_ns),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLimits {
    pub max_channels: i64,
    pub channel: ChannelLimits,
    /// Channel-specific overrides, keyed by channel name.
    pub overrides: BTreeMap<String, ChannelLimits>,
}

impl StoreLimits {
    pub fn validate(&self) -> Result<(), LimitsError> {
        if self.max_channels < 0 {
            return Err(LimitsError::Negative {
                name: "max_channels",
                value: self.max_channels,
            });
        }
        self.channel.validate()?;
        for (name, limits) in &self.overrides {
            if super::validate_channel_name(name).is_err() {
                return Err(LimitsError::BadOverrideName(name.clone()));
            }
            limits.validate()?;
        }
        Ok(())
    }

    /// Effective limits for a channel: override fields win where set.
    pub fn limits_for(&self, channel: &str) -> ChannelLimits {
        match self.overrides.get(channel) {
            Some(specific) => specific.merged_over(&self.channel),
            None => self.channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_limits_rejected() {
        let mut limits = StoreLimits::default();
        limits.channel.max_msgs = -1;
        assert!(matches!(
            limits.validate(),
            Err(LimitsError::Negative { name: "max_msgs", .. })
        ));
    }

    #[test]
    fn overrides_win_where_set() {
        let mut limits = StoreLimits {
            max_channels: 10,
            channel: ChannelLimits {
                max_subscriptions: 5,
                max_msgs: 100,
                max_bytes: 0,
                max_age_ns: 7,
            },
            overrides: BTreeMap::new(),
        };
        limits.overrides.insert(
            "loud".to_string(),
            ChannelLimits {
                max_msgs: 1000,
                ..ChannelLimits::default()
            },
        );

        let loud = limits.limits_for("loud");
        assert_eq!(loud.max_msgs, 1000);
        assert_eq!(loud.max_subscriptions, 5);
        assert_eq!(loud.max_age_ns, 7);
        assert_eq!(limits.limits_for("quiet"), limits.channel);
    }

    #[test]
    fn bad_override_name_rejected() {
        let mut limits = StoreLimits::default();
        limits
            .overrides
            .insert("no..good".to_string(), ChannelLimits::default());
        assert!(matches!(
            limits.validate(),
            Err(LimitsError::BadOverrideName(_))
        ));
    }
}
