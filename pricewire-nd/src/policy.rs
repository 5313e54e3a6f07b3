//! Tier policy table
//!
//! Delays, channel allowances, and per-channel daily caps are policy
//! values, not code paths: the dispatcher only ever asks `allows`,
//! `delay_groups`, and `daily_cap`. Changing who waits how long, or which
//! tier may use which channel, means editing this table, not dispatch
//! logic.

use pricewire_common::models::{Channel, Tier};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One scheduling group: tiers that share a delay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierGroup {
    pub tiers: Vec<Tier>,
    pub delay_ms: u64,
}

/// Immutable tier policy loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    groups: Vec<TierGroup>,
    allowed: HashMap<Tier, HashSet<Channel>>,
    daily_caps: HashMap<Channel, u32>,
}

impl TierPolicy {
    pub fn new(
        groups: Vec<TierGroup>,
        allowed: HashMap<Tier, HashSet<Channel>>,
        daily_caps: HashMap<Channel, u32>,
    ) -> Self {
        Self {
            groups,
            allowed,
            daily_caps,
        }
    }

    /// Production policy: paying tiers first, free tier three days later.
    pub fn standard() -> Self {
        let groups = vec![
            TierGroup {
                tiers: vec![Tier::Pro, Tier::Elite],
                delay_ms: 0,
            },
            TierGroup {
                tiers: vec![Tier::Starter],
                delay_ms: 24 * 60 * 60 * 1000,
            },
            TierGroup {
                tiers: vec![Tier::Free],
                delay_ms: 72 * 60 * 60 * 1000,
            },
        ];

        let mut allowed: HashMap<Tier, HashSet<Channel>> = HashMap::new();
        allowed.insert(Tier::Free, HashSet::from([Channel::Email]));
        allowed.insert(
            Tier::Starter,
            HashSet::from([Channel::Email, Channel::Discord]),
        );
        allowed.insert(
            Tier::Pro,
            HashSet::from([
                Channel::Email,
                Channel::Discord,
                Channel::Sms,
                Channel::Telegram,
                Channel::Whatsapp,
            ]),
        );
        allowed.insert(
            Tier::Elite,
            HashSet::from([
                Channel::Email,
                Channel::Discord,
                Channel::Sms,
                Channel::Telegram,
                Channel::Whatsapp,
                Channel::Webhook,
                Channel::Priority,
            ]),
        );

        let daily_caps = HashMap::from([(Channel::Whatsapp, 3)]);

        Self::new(groups, allowed, daily_caps)
    }

    /// Whether `tier` may receive notifications over `channel`
    pub fn allows(&self, tier: Tier, channel: Channel) -> bool {
        self.allowed
            .get(&tier)
            .is_some_and(|channels| channels.contains(&channel))
    }

    /// Scheduling groups in policy order
    pub fn delay_groups(&self) -> &[TierGroup] {
        &self.groups
    }

    /// Per-user daily send cap for `channel`, if it has one
    pub fn daily_cap(&self, channel: Channel) -> Option<u32> {
        self.daily_caps.get(&channel).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_delays_match_tier_table() {
        let policy = TierPolicy::standard();
        let groups = policy.delay_groups();
        assert_eq!(groups.len(), 3);

        assert_eq!(groups[0].tiers, vec![Tier::Pro, Tier::Elite]);
        assert_eq!(groups[0].delay_ms, 0);
        assert_eq!(groups[1].tiers, vec![Tier::Starter]);
        assert_eq!(groups[1].delay_ms, 86_400_000);
        assert_eq!(groups[2].tiers, vec![Tier::Free]);
        assert_eq!(groups[2].delay_ms, 259_200_000);
    }

    #[test]
    fn channel_allowances_widen_with_tier() {
        let policy = TierPolicy::standard();

        assert!(policy.allows(Tier::Free, Channel::Email));
        assert!(!policy.allows(Tier::Free, Channel::Discord));

        assert!(policy.allows(Tier::Starter, Channel::Discord));
        assert!(!policy.allows(Tier::Starter, Channel::Sms));

        assert!(policy.allows(Tier::Pro, Channel::Sms));
        assert!(policy.allows(Tier::Pro, Channel::Whatsapp));
        assert!(!policy.allows(Tier::Pro, Channel::Webhook));
        assert!(!policy.allows(Tier::Pro, Channel::Priority));

        assert!(policy.allows(Tier::Elite, Channel::Webhook));
        assert!(policy.allows(Tier::Elite, Channel::Priority));
    }

    #[test]
    fn whatsapp_carries_a_daily_cap() {
        let policy = TierPolicy::standard();
        assert_eq!(policy.daily_cap(Channel::Whatsapp), Some(3));
        assert_eq!(policy.daily_cap(Channel::Email), None);
    }
}
