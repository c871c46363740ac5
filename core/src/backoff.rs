/// Exponential reconnect backoff
use crate::config::Config;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: config.backoff_base,
            factor: config.backoff_factor,
            max: config.backoff_max,
            jitter: config.backoff_jitter,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let pow = (attempt - 1).min(16); // prevent overflow
        self.factor
            .max(1)
            .checked_pow(pow)
            .and_then(|mult| self.base.checked_mul(mult))
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay with up to 10% random spread, still capped at `max`
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let spread = delay.as_millis() as u64 / 10;
        if !self.jitter || spread == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max)
    }

    pub async fn sleep(&self, attempt: u32) {
        tokio::time::sleep(self.jittered(attempt)).await;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
