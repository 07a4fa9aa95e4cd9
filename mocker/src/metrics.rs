//! Prometheus metrics exposed on `/metrics`.
use anyhow::Result;
use prometheus::{
    core::Collector, Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "mocker";

/// Registry holding the mocker's counters and gauges.
pub struct Metrics {
    registry: Registry,
    operations: IntCounterVec,
    errors: IntCounterVec,
    working_set: IntGaugeVec,
    ready: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let operations = register(
            &registry,
            IntCounterVec::new(
                Opts::new("kvstore_operations_total", "Writes applied to the kvstore")
                    .namespace(NAMESPACE),
                &["cluster", "kind", "action"],
            )?,
        )?;
        let errors = register(
            &registry,
            IntCounterVec::new(
                Opts::new("kvstore_errors_total", "Writes rejected by the kvstore")
                    .namespace(NAMESPACE),
                &["cluster", "kind", "action"],
            )?,
        )?;
        let working_set = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("working_set_size", "Live objects per cluster and kind")
                    .namespace(NAMESPACE),
                &["cluster", "kind"],
            )?,
        )?;
        let ready = register(
            &registry,
            IntGauge::with_opts(
                Opts::new("ready", "Whether every simulated cluster completed its bootstrap")
                    .namespace(NAMESPACE),
            )?,
        )?;

        Ok(Self {
            registry,
            operations,
            errors,
            working_set,
            ready,
        })
    }

    /// Record a write attempt, `ok` telling whether the backend accepted it.
    pub fn record_write(&self, cluster: &str, kind: &str, action: &str, ok: bool) {
        let labels = [cluster, kind, action];
        if ok {
            self.operations.with_label_values(&labels).inc();
        } else {
            self.errors.with_label_values(&labels).inc();
        }
    }

    /// Gauge tracking the size of one working set.
    pub fn working_set(&self, cluster: &str, kind: &str) -> IntGauge {
        self.working_set.with_label_values(&[cluster, kind])
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.set(i64::from(ready));
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> Result<C> {
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_write("cluster-001", "nodes", "upsert", true);
        metrics.record_write("cluster-001", "nodes", "upsert", true);
        metrics.record_write("cluster-001", "nodes", "delete", false);
        metrics.working_set("cluster-001", "nodes").set(5);
        metrics.set_ready(true);

        let text = metrics.render().unwrap();
        assert!(text.contains(
            r#"mocker_kvstore_operations_total{action="upsert",cluster="cluster-001",kind="nodes"} 2"#
        ));
        assert!(text.contains(
            r#"mocker_kvstore_errors_total{action="delete",cluster="cluster-001",kind="nodes"} 1"#
        ));
        assert!(text.contains(r#"mocker_working_set_size{cluster="cluster-001",kind="nodes"} 5"#));
        assert!(text.contains("mocker_ready 1"));
    }
}
