//! In-process counter registry exported in Prometheus text format at `/metrics`.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters keyed by metric name and a sorted label set
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<(String, Vec<(String, String)>), Counter>,
}

impl MetricsRegistry {
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Counter {
        let mut key_labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        key_labels.sort();
        self.counters
            .entry((name.to_string(), key_labels))
            .or_default()
            .clone()
    }

    /// Renders every counter in Prometheus exposition format
    pub fn export(&self) -> String {
        let mut rows: Vec<(String, String, u64)> = self
            .counters
            .iter()
            .map(|entry| {
                let ((name, labels), counter) = entry.pair();
                let rendered = if labels.is_empty() {
                    String::new()
                } else {
                    let inner = labels
                        .iter()
                        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
                        .collect::<Vec<_>>()
                        .join(",");
                    format!("{{{}}}", inner)
                };
                (name.clone(), rendered, counter.get())
            })
            .collect();
        rows.sort();

        let mut output = String::new();
        let mut last_name: Option<&str> = None;
        for (name, labels, value) in &rows {
            if last_name != Some(name.as_str()) {
                output.push_str(&format!("# TYPE {} counter\n", name));
                last_name = Some(name.as_str());
            }
            output.push_str(&format!("{}{} {}\n", name, labels, value));
        }
        output
    }
}

lazy_static::lazy_static! {
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::default();
}

pub fn increment_counter(name: &str) {
    METRICS.counter(name, &[]).inc();
}

pub fn increment_counter_with(name: &str, labels: &[(&str, &str)]) {
    METRICS.counter(name, labels).inc();
}

pub async fn metrics_handler() -> ([(axum::http::HeaderName, &'static str); 1], String) {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        METRICS.export(),
    )
}
