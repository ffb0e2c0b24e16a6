
use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder, IntCounter, IntGauge};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub config_updates: IntCounter,
    pub config_update_failures: IntCounter,
    pub commands: IntCounter,
    pub command_failures: IntCounter,
    pub log_subscribers: IntGauge,
}

impl Metrics {
    pub fn try_new() -> Result<Self> {
        let registry = Registry::new();
        let config_updates = IntCounter::new("console_config_updates_total", "Config updates written")
            .context("create metric config_updates")?;
        let config_update_failures = IntCounter::new("console_config_update_failures_total", "Config updates that failed")
            .context("create metric config_update_failures")?;
        let commands = IntCounter::new("console_commands_total", "Reload/restart/operator commands run")
            .context("create metric commands")?;
        let command_failures = IntCounter::new("console_command_failures_total", "Commands that failed or exited non-zero")
            .context("create metric command_failures")?;
        let log_subscribers = IntGauge::new("console_log_subscribers", "Open log streams")
            .context("create metric log_subscribers")?;

        registry.register(Box::new(config_updates.clone()))
            .context("register config_updates")?;
        registry.register(Box::new(config_update_failures.clone()))
            .context("register config_update_failures")?;
        registry.register(Box::new(commands.clone()))
            .context("register commands")?;
        registry.register(Box::new(command_failures.clone()))
            .context("register command_failures")?;
        registry.register(Box::new(log_subscribers.clone()))
            .context("register log_subscribers")?;

        Ok(Self { registry, config_updates, config_update_failures, commands, command_failures, log_subscribers })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# metrics encode error: {e}");
        }
        String::from_utf8(buffer).unwrap_or_else(|_| "# metrics utf8 error".to_string())
    }

    /// Keeps `log_subscribers` raised for as long as the guard lives.
    pub fn subscriber_guard(&self) -> SubscriberGuard {
        self.log_subscribers.inc();
        SubscriberGuard(self.log_subscribers.clone())
    }
}

pub struct SubscriberGuard(IntGauge);

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_open_streams() {
        let m = Metrics::try_new().unwrap();
        let g1 = m.subscriber_guard();
        let g2 = m.subscriber_guard();
        assert_eq!(m.log_subscribers.get(), 2);
        drop(g1);
        assert_eq!(m.log_subscribers.get(), 1);
        drop(g2);
        assert_eq!(m.log_subscribers.get(), 0);
    }

    #[test]
    fn render_exposes_counters() {
        let m = Metrics::try_new().unwrap();
        m.config_updates.inc();
        let text = m.render();
        assert!(text.contains("console_config_updates_total 1"));
        assert!(text.contains("console_log_subscribers 0"));
    }
}
