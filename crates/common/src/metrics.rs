use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    executions_started: CounterVec,
    executions_finished: CounterVec,
    executions_running: GaugeVec,
    steps_started: CounterVec,
    reports_accepted: CounterVec,
    reports_rejected: CounterVec,
    timeouts: CounterVec,
    step_seconds: HistogramVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_executions_started(&self, mode: &str) {
        self.inner
            .executions_started
            .with_label_values(&[mode])
            .inc();
        self.inner.executions_running.with_label_values(&[]).inc();
    }

    pub fn inc_executions_finished(&self, state: &str) {
        self.inner
            .executions_finished
            .with_label_values(&[state])
            .inc();
        self.inner.executions_running.with_label_values(&[]).dec();
    }

    pub fn inc_steps_started(&self, execution_id: &str) {
        self.inner
            .steps_started
            .with_label_values(&[execution_id])
            .inc();
    }

    pub fn inc_reports_accepted(&self, execution_id: &str) {
        self.inner
            .reports_accepted
            .with_label_values(&[execution_id])
            .inc();
    }

    pub fn inc_reports_rejected(&self, execution_id: &str, reason: &str) {
        self.inner
            .reports_rejected
            .with_label_values(&[execution_id, reason])
            .inc();
    }

    pub fn inc_timeouts(&self, execution_id: &str) {
        self.inner.timeouts.with_label_values(&[execution_id]).inc();
    }

    pub fn observe_step_seconds(&self, execution_id: &str, seconds: f64) {
        self.inner
            .step_seconds
            .with_label_values(&[execution_id])
            .observe(seconds);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let executions_started = counter_vec(
            &registry,
            "vf_executions_started_total",
            "Executions accepted by the conductor",
            &["mode"],
        );
        let executions_finished = counter_vec(
            &registry,
            "vf_executions_finished_total",
            "Executions that reached a terminal state",
            &["state"],
        );
        let executions_running = gauge_vec(
            &registry,
            "vf_executions_running",
            "Executions currently in the running state",
            &[],
        );
        let steps_started = counter_vec(
            &registry,
            "vf_steps_started_total",
            "Superstep fan-outs issued",
            &["execution_id"],
        );
        let reports_accepted = counter_vec(
            &registry,
            "vf_reports_accepted_total",
            "Worker step reports merged into the barrier",
            &["execution_id"],
        );
        let reports_rejected = counter_vec(
            &registry,
            "vf_reports_rejected_total",
            "Worker step reports discarded by protocol validation",
            &["execution_id", "reason"],
        );
        let timeouts = counter_vec(
            &registry,
            "vf_step_timeouts_total",
            "Step deadlines that fired before the barrier closed",
            &["execution_id"],
        );
        let step_seconds = histogram_vec(
            &registry,
            "vf_step_seconds",
            "Wall time from fan-out to barrier close per superstep",
            &["execution_id"],
        );

        Self {
            registry,
            executions_started,
            executions_finished,
            executions_running,
            steps_started,
            reports_accepted,
            reports_rejected,
            timeouts,
            step_seconds,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
