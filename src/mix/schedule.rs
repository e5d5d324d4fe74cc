use rand::Rng;
use std::time::Duration;

use crate::config::ClientConfig;

/// How busy the client is, which sets how often it polls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixActivity {
    /// Registered in a round past input registration.
    Active,
    /// Coins queued or registered in input registration.
    Passive,
    Dormant,
}

/// Random pause before acting on a status update so our requests do not
/// line up with everyone else's.
pub fn response_delay(config: &ClientConfig) -> Duration {
    if config.skips_response_delay() || config.max_response_delay_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rand::thread_rng().gen_range(0..=config.max_response_delay_secs))
}

pub fn next_poll_delay(config: &ClientConfig, activity: MixActivity, smallest_timeout_secs: Option<u64>) -> Duration {
    let mut rng = rand::thread_rng();
    match activity {
        MixActivity::Active => {
            let [lo, hi] = config.active_poll_secs;
            Duration::from_secs(rng.gen_range(lo..=hi))
        }
        MixActivity::Passive => {
            let timeout = smallest_timeout_secs.unwrap_or(config.active_poll_secs[1]) as f64;
            let fraction = rng.gen_range(0.2..=0.6);
            Duration::from_secs_f64((timeout * fraction).max(1.0))
        }
        MixActivity::Dormant => {
            let [lo, hi] = config.dormant_poll_secs;
            Duration::from_secs(rng.gen_range(lo..=hi))
        }
    }
}
