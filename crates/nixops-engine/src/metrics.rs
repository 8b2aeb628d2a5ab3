//! Prometheus metrics named exactly per spec §6's observability surface.

use prometheus::{
    HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    pub reconciles_total: IntCounterVec,
    pub apply_total: IntCounterVec,
    pub ssh_failures_total: IntCounterVec,
    pub reconcile_duration_seconds: HistogramVec,
    pub apply_duration_seconds: HistogramVec,
    pub managed_machines: IntGauge,
    pub machines_reachable: IntGauge,
    registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciles_total = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconcile attempts by outcome"),
            &["result"],
        )?;
        let apply_total = IntCounterVec::new(
            Opts::new("apply_total", "Remote apply invocations by mode and outcome"),
            &["mode", "result"],
        )?;
        let ssh_failures_total = IntCounterVec::new(
            Opts::new("ssh_failures_total", "SSH-layer failures by kind"),
            &["kind"],
        )?;
        let reconcile_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "reconcile_duration_seconds",
                "Wall-clock time spent in one reconcile invocation",
            ),
            &["result"],
        )?;
        let apply_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "apply_duration_seconds",
                "Wall-clock time spent in the remote apply step",
            ),
            &["mode"],
        )?;
        let managed_machines = IntGauge::new("managed_machines", "Machines currently tracked")?;
        let machines_reachable =
            IntGauge::new("machines_reachable", "Machines currently marked reachable")?;

        registry.register(Box::new(reconciles_total.clone()))?;
        registry.register(Box::new(apply_total.clone()))?;
        registry.register(Box::new(ssh_failures_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(apply_duration_seconds.clone()))?;
        registry.register(Box::new(managed_machines.clone()))?;
        registry.register(Box::new(machines_reachable.clone()))?;

        Ok(Self {
            reconciles_total,
            apply_total,
            ssh_failures_total,
            reconcile_duration_seconds,
            apply_duration_seconds,
            managed_machines,
            machines_reachable,
            registry,
        })
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&families)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_duplicate_names() {
        let m = Metrics::new().unwrap();
        m.reconciles_total.with_label_values(&["success"]).inc();
        m.apply_total.with_label_values(&["switch", "success"]).inc();
        let text = m.encode().unwrap();
        assert!(text.contains("reconciles_total"));
        assert!(text.contains("apply_total"));
    }
}
