use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the admission gateway
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    allowed_checks: CounterVec,
    denied_checks: CounterVec,
    fail_closed_checks: CounterVec,
    unknown_rule_checks: Counter,

    // Local deny cache
    deny_cache_hits: Counter,

    // Store metrics
    store_failures: Counter,
    store_op_duration: Histogram,

    // Service metrics
    decision_duration: Histogram,
    rules_reload_success: Counter,
    rules_reload_error: Counter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let allowed_checks = CounterVec::new(
            Opts::new("tokengate_allowed_checks", "Checks that passed admission"),
            &["rule"],
        )?;

        let denied_checks = CounterVec::new(
            Opts::new(
                "tokengate_denied_checks",
                "Checks denied because the bucket was exhausted",
            ),
            &["rule"],
        )?;

        let fail_closed_checks = CounterVec::new(
            Opts::new(
                "tokengate_fail_closed_checks",
                "Checks denied because the token store was unavailable",
            ),
            &["rule"],
        )?;

        let unknown_rule_checks = Counter::new(
            "tokengate_unknown_rule_checks",
            "Checks rejected because the rule id is not configured",
        )?;

        let deny_cache_hits = Counter::new(
            "tokengate_deny_cache_hits",
            "Denials served from the local deny cache without a store round trip",
        )?;

        let store_failures = Counter::new(
            "tokengate_store_failures",
            "Atomic store operations that failed after the bounded retry",
        )?;

        let store_op_duration = Histogram::with_opts(HistogramOpts::new(
            "tokengate_store_op_duration_seconds",
            "Duration of atomic check-and-consume operations",
        ))?;

        let decision_duration = Histogram::with_opts(HistogramOpts::new(
            "tokengate_decision_duration_seconds",
            "End-to-end duration of admission decisions",
        ))?;

        let rules_reload_success = Counter::new(
            "tokengate_rules_reload_success",
            "Successful rule snapshot reloads",
        )?;

        let rules_reload_error = Counter::new(
            "tokengate_rules_reload_error",
            "Failed rule snapshot reloads (stale snapshot kept)",
        )?;

        registry.register(Box::new(allowed_checks.clone()))?;
        registry.register(Box::new(denied_checks.clone()))?;
        registry.register(Box::new(fail_closed_checks.clone()))?;
        registry.register(Box::new(unknown_rule_checks.clone()))?;
        registry.register(Box::new(deny_cache_hits.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;
        registry.register(Box::new(store_op_duration.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;
        registry.register(Box::new(rules_reload_success.clone()))?;
        registry.register(Box::new(rules_reload_error.clone()))?;

        Ok(Self {
            registry,
            allowed_checks,
            denied_checks,
            fail_closed_checks,
            unknown_rule_checks,
            deny_cache_hits,
            store_failures,
            store_op_duration,
            decision_duration,
            rules_reload_success,
            rules_reload_error,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_allowed(&self, rule: &str) {
        self.allowed_checks.with_label_values(&[rule]).inc();
    }

    pub fn record_denied(&self, rule: &str) {
        self.denied_checks.with_label_values(&[rule]).inc();
    }

    pub fn record_fail_closed(&self, rule: &str) {
        self.fail_closed_checks.with_label_values(&[rule]).inc();
    }

    pub fn record_unknown_rule(&self) {
        self.unknown_rule_checks.inc();
    }

    pub fn record_deny_cache_hit(&self) {
        self.deny_cache_hits.inc();
    }

    pub fn record_store_failure(&self) {
        self.store_failures.inc();
    }

    pub fn observe_store_op(&self, duration_seconds: f64) {
        self.store_op_duration.observe(duration_seconds);
    }

    pub fn record_rules_reload_success(&self) {
        self.rules_reload_success.inc();
    }

    pub fn record_rules_reload_error(&self) {
        self.rules_reload_error.inc();
    }

    /// Timer for the end-to-end decision path
    pub fn start_decision_timer(&self) -> prometheus::HistogramTimer {
        self.decision_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("failed to create default metrics")
    }
}
