//! Simulated network conditions.
//!
//! The core depends only on the [`Profile`] trait: a (delay, drop)
//! pair consulted by the acceptor before it replies and by the proposer
//! before it sends. [`StandardProfile`] is one concrete implementation,
//! matching the four named profiles of the reference deployment, so the
//! binary is runnable out of the box; callers embedding the core
//! elsewhere are free to supply their own `Profile`.

use rand::Rng;
use std::time::Duration;

/// A source of simulated delay and message loss.
pub trait Profile: Send + Sync {
    /// Sample a delay to wait before sending or replying.
    fn delay(&self) -> Duration;

    /// Decide, probabilistically, whether the in-flight message should
    /// be dropped instead of sent.
    fn should_drop(&self) -> bool;

    /// The largest delay this profile can produce. Used to size the
    /// per-message timeout (`max_delay + 1000ms`).
    fn max_delay(&self) -> Duration;

    /// The timeout a single prepare/accept task should use while
    /// waiting for a reply under this profile.
    fn individual_timeout(&self) -> Duration {
        self.max_delay() + Duration::from_millis(1000)
    }
}

/// One of the four named profiles from the reference deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StandardProfile {
    /// Fast and almost always reliable.
    Immediate,
    /// Slow and frequently unreachable.
    Intermittent,
    /// Fast but often drops replies.
    Unreliable,
    /// Moderate delay, mostly reliable.
    Normal,
}

impl StandardProfile {
    /// The profile the reference deployment assigns to a given peer id:
    /// 1 -> `Immediate`, 2 -> `Intermittent`, 3 -> `Unreliable`, else
    /// `Normal`.
    #[must_use]
    pub fn for_peer(peer_id: u8) -> Self {
        match peer_id {
            1 => StandardProfile::Immediate,
            2 => StandardProfile::Intermittent,
            3 => StandardProfile::Unreliable,
            _ => StandardProfile::Normal,
        }
    }

    fn max_delay_ms(self) -> u64 {
        match self {
            StandardProfile::Immediate => 10,
            StandardProfile::Intermittent => 5000,
            StandardProfile::Unreliable => 1000,
            StandardProfile::Normal => 500,
        }
    }

    fn reliability(self) -> f64 {
        match self {
            StandardProfile::Immediate => 0.99,
            StandardProfile::Intermittent => 0.70,
            StandardProfile::Unreliable => 0.80,
            StandardProfile::Normal => 0.95,
        }
    }
}

impl Profile for StandardProfile {
    fn delay(&self) -> Duration {
        let max = self.max_delay_ms();
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..max))
    }

    fn should_drop(&self) -> bool {
        rand::rng().random::<f64>() >= self.reliability()
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_profiles_by_id() {
        assert_eq!(StandardProfile::for_peer(1), StandardProfile::Immediate);
        assert_eq!(StandardProfile::for_peer(2), StandardProfile::Intermittent);
        assert_eq!(StandardProfile::for_peer(3), StandardProfile::Unreliable);
        assert_eq!(StandardProfile::for_peer(4), StandardProfile::Normal);
        assert_eq!(StandardProfile::for_peer(9), StandardProfile::Normal);
    }

    #[test]
    fn individual_timeout_is_max_delay_plus_one_second() {
        let profile = StandardProfile::Intermittent;
        assert_eq!(
            profile.individual_timeout(),
            Duration::from_millis(5000) + Duration::from_millis(1000)
        );
    }

    #[test]
    fn delay_never_exceeds_max_delay() {
        let profile = StandardProfile::Normal;
        for _ in 0..1000 {
            assert!(profile.delay() < profile.max_delay());
        }
    }
}
