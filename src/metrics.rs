//! Prometheus metrics (feature `metrics`) and tracing span helpers (feature `tracing`).

#[cfg(feature = "metrics")]
pub use self::prometheus_metrics::{LaunchguardMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<LaunchguardMetrics> = Lazy::new(LaunchguardMetrics::init);

    pub struct LaunchguardMetrics {
        registry: Registry,
        // Keeps the reader registered for as long as the instruments live.
        _provider: SdkMeterProvider,
        pub lock_wait: Histogram<f64>,
        pub lock_timeouts_total: Counter<u64>,
        pub scripts_applied_total: Counter<u64>,
        pub batch_failures_total: Counter<u64>,
    }

    impl LaunchguardMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => SdkMeterProvider::builder().with_reader(exporter).build(),
                Err(e) => {
                    log::warn!("failed to build prometheus exporter, metrics disabled: {}", e);
                    SdkMeterProvider::builder().build()
                }
            };
            let meter = provider.meter("launchguard");

            let lock_wait = meter
                .f64_histogram("launchguard_lock_wait_seconds")
                .with_description("Time spent waiting for the migration advisory lock")
                .with_unit("s")
                .build();

            let lock_timeouts_total = meter
                .u64_counter("launchguard_lock_timeouts_total")
                .with_description("Lock acquisitions that gave up after the maximum wait")
                .build();

            let scripts_applied_total = meter
                .u64_counter("launchguard_scripts_applied_total")
                .with_description("Scripts committed, by kind (migration or seed)")
                .build();

            let batch_failures_total = meter
                .u64_counter("launchguard_batch_failures_total")
                .with_description("Script batches rolled back, by kind (migration or seed)")
                .build();

            Self {
                registry,
                _provider: provider,
                lock_wait,
                lock_timeouts_total,
                scripts_applied_total,
                batch_failures_total,
            }
        }

        pub fn record_lock_wait(&self, waited: Duration) {
            self.lock_wait.record(waited.as_secs_f64(), &[]);
        }

        pub fn record_lock_timeout(&self) {
            self.lock_timeouts_total.add(1, &[]);
        }

        pub fn record_scripts_applied(&self, kind: &'static str, count: usize) {
            self.scripts_applied_total
                .add(count as u64, &[KeyValue::new("kind", kind)]);
        }

        pub fn record_batch_failure(&self, kind: &'static str) {
            self.batch_failures_total.add(1, &[KeyValue::new("kind", kind)]);
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        /// Current values in the Prometheus text exposition format.
        pub fn gather(&self) -> Result<String, prometheus::Error> {
            let mut buffer = Vec::new();
            TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
            Ok(String::from_utf8_lossy(&buffer).into_owned())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_recorded_values_are_exported() {
            METRICS.record_scripts_applied("migration", 3);
            METRICS.record_batch_failure("seed");
            METRICS.record_lock_timeout();

            let text = METRICS.gather().unwrap();
            assert!(text.contains("launchguard_scripts_applied_total"));
            assert!(text.contains("launchguard_batch_failures_total"));
            assert!(text.contains("launchguard_lock_timeouts_total"));
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn orchestrator_span(application_name: &str) -> Span {
        info_span!("launchguard.run", application_name = %application_name)
    }

    pub fn connect_span() -> Span {
        info_span!("launchguard.connect")
    }

    pub fn acquire_lock_span(lock_key: i64) -> Span {
        info_span!("launchguard.acquire_lock", lock_key)
    }

    pub fn script_batch_span(kind: &'static str, scripts: usize) -> Span {
        info_span!("launchguard.batch", kind, scripts)
    }

    pub fn execute_script_span() -> Span {
        info_span!("launchguard.execute_script")
    }
}
