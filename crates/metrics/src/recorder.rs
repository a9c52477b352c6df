//! Recorder installation.

use {anyhow::Result, tracing::info};

/// Handle to the installed recorder.
#[derive(Clone)]
pub struct MetricsHandle {
    #[cfg(feature = "prometheus")]
    prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format, or an empty string when the
    /// exporter is not compiled in.
    #[must_use]
    pub fn render(&self) -> String {
        #[cfg(feature = "prometheus")]
        {
            self.prometheus_handle.render()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            String::new()
        }
    }
}

/// Install the global recorder. Call once at startup.
pub fn init_metrics(global_labels: &[(String, String)]) -> Result<MetricsHandle> {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

        let mut builder = PrometheusBuilder::new().set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            &crate::buckets::LIFECYCLE_DURATION,
        )?;
        for (key, value) in global_labels {
            builder = builder.add_global_label(key, value);
        }
        let handle = builder.install_recorder()?;
        info!("prometheus metrics recorder installed");
        Ok(MetricsHandle {
            prometheus_handle: handle,
        })
    }

    #[cfg(not(feature = "prometheus"))]
    {
        let _ = global_labels;
        info!("metrics exporter not compiled in, recording is a no-op");
        Ok(MetricsHandle {})
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, not(feature = "prometheus")))]
mod tests {
    use super::*;

    #[test]
    fn noop_recorder_renders_empty() {
        let handle = init_metrics(&[]).unwrap();
        assert!(handle.render().is_empty());
    }
}
