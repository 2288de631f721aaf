//! Metrics and tracing hooks for migration runs
//!
//! With the `metrics` feature, [`METRICS`] records applied/failed/reverted
//! counts and durations through OpenTelemetry and exposes them in Prometheus
//! text format via [`MigrationMetrics::encode_text`]. With the `tracing`
//! feature, [`tracing_helpers`] provides the spans the runner enters.

#[cfg(feature = "metrics")]
pub use self::prometheus_metrics::{MigrationMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use crate::migration::MigrationId;
    use once_cell::sync::Lazy;
    use opentelemetry::{
        metrics::{Counter, Histogram, MeterProvider as _},
        KeyValue,
    };
    use opentelemetry_prometheus::PrometheusExporter;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<MigrationMetrics> = Lazy::new(MigrationMetrics::init);

    pub struct MigrationMetrics {
        registry: Registry,
        _provider: SdkMeterProvider,
        pub migrations_applied: Counter<u64>,
        pub migrations_failed: Counter<u64>,
        pub migrations_reverted: Counter<u64>,
        pub migration_duration: Histogram<f64>,
        pub lock_wait_duration: Histogram<f64>,
    }

    impl MigrationMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let exporter = opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build();
            Self::assemble(registry, exporter)
        }

        /// Build the instruments on top of `exporter`
        ///
        /// Without an exporter the instruments still record, but nothing
        /// reaches the registry and [`encode_text`](Self::encode_text) stays
        /// empty.
        fn assemble<E: std::fmt::Display>(
            registry: Registry,
            exporter: Result<PrometheusExporter, E>,
        ) -> Self {
            let provider = match exporter {
                Ok(exporter) => SdkMeterProvider::builder().with_reader(exporter).build(),
                Err(e) => {
                    log::warn!("Prometheus exporter unavailable, migration metrics are not exported: {e}");
                    SdkMeterProvider::builder().build()
                }
            };
            let meter = provider.meter("lockkeeper");

            let migrations_applied = meter
                .u64_counter("lockkeeper_migrations_applied_total")
                .with_description("Migrations applied")
                .build();

            let migrations_failed = meter
                .u64_counter("lockkeeper_migrations_failed_total")
                .with_description("Migrations that failed and were rolled back")
                .build();

            let migrations_reverted = meter
                .u64_counter("lockkeeper_migrations_reverted_total")
                .with_description("Migrations reverted")
                .build();

            let migration_duration = meter
                .f64_histogram("lockkeeper_migration_duration_seconds")
                .with_description("Time spent applying or reverting one migration")
                .build();

            let lock_wait_duration = meter
                .f64_histogram("lockkeeper_lock_wait_seconds")
                .with_description("Time spent waiting for the migration lock")
                .build();

            Self {
                registry,
                _provider: provider,
                migrations_applied,
                migrations_failed,
                migrations_reverted,
                migration_duration,
                lock_wait_duration,
            }
        }

        pub fn record_applied(&self, id: MigrationId, elapsed: Duration) {
            let attrs = [KeyValue::new("migration_id", id.value())];
            self.migrations_applied.add(1, &attrs);
            self.migration_duration
                .record(elapsed.as_secs_f64(), &[KeyValue::new("direction", "apply")]);
        }

        pub fn record_failed(&self, id: MigrationId) {
            self.migrations_failed
                .add(1, &[KeyValue::new("migration_id", id.value())]);
        }

        pub fn record_reverted(&self, id: MigrationId, elapsed: Duration) {
            let attrs = [KeyValue::new("migration_id", id.value())];
            self.migrations_reverted.add(1, &attrs);
            self.migration_duration
                .record(elapsed.as_secs_f64(), &[KeyValue::new("direction", "revert")]);
        }

        pub fn observe_lock_wait(&self, waited: Duration) {
            self.lock_wait_duration.record(waited.as_secs_f64(), &[]);
        }

        /// Current metric values in Prometheus text exposition format
        pub fn encode_text(&self) -> Result<String, prometheus::Error> {
            let mut buf = Vec::new();
            TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_recorded_metrics_are_exported() {
            METRICS.record_applied(MigrationId::new(1), Duration::from_millis(5));
            METRICS.record_failed(MigrationId::new(2));
            METRICS.observe_lock_wait(Duration::from_millis(1));

            let text = METRICS.encode_text().unwrap();
            assert!(text.contains("lockkeeper_migrations_applied_total"));
            assert!(text.contains("lockkeeper_migrations_failed_total"));
            assert!(text.contains("lockkeeper_lock_wait_seconds"));
        }

        #[test]
        fn test_missing_exporter_still_records() {
            let metrics =
                MigrationMetrics::assemble(Registry::new(), Err::<PrometheusExporter, _>("no exporter"));
            metrics.record_applied(MigrationId::new(1), Duration::from_millis(5));
            metrics.record_reverted(MigrationId::new(1), Duration::from_millis(5));
            metrics.observe_lock_wait(Duration::from_millis(1));

            let text = metrics.encode_text().unwrap();
            assert!(!text.contains("lockkeeper_migrations_applied_total"));
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use crate::migration::MigrationId;
    use tracing::{debug_span, info_span, Span};

    const MAX_STATEMENT_CHARS: usize = 200;

    pub fn run_pending_span() -> Span {
        info_span!("lockkeeper.run_pending")
    }

    pub fn apply_migration_span(id: MigrationId, name: &str) -> Span {
        info_span!("lockkeeper.apply", migration_id = id.value(), name = name)
    }

    pub fn revert_migration_span(id: MigrationId, name: &str) -> Span {
        info_span!("lockkeeper.revert", migration_id = id.value(), name = name)
    }

    pub fn acquire_lock_span(key: i64) -> Span {
        info_span!("lockkeeper.acquire_lock", key = key)
    }

    pub fn begin_transaction_span() -> Span {
        debug_span!("lockkeeper.begin_transaction")
    }

    pub fn rollback_transaction_span() -> Span {
        debug_span!("lockkeeper.rollback_transaction")
    }

    /// Statement text is truncated to keep span fields bounded
    pub fn execute_statement_span(sql: &str) -> Span {
        let statement: String = sql.chars().take(MAX_STATEMENT_CHARS).collect();
        debug_span!("lockkeeper.statement", sql = %statement)
    }
}
