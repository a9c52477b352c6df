//! Metric names and label keys.

/// Label keys shared across metrics.
pub mod labels {
    pub const BACKEND: &str = "backend";
    pub const OPERATION: &str = "operation";
    pub const OUTCOME: &str = "outcome";
}

/// Histogram buckets.
pub mod buckets {
    /// Exec and lifecycle step durations, in seconds.
    pub const LIFECYCLE_DURATION: [f64; 10] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0];
}

/// Exec inside bot containers.
pub mod exec {
    pub const EXECUTIONS_TOTAL: &str = "botbox_exec_executions_total";
    pub const DURATION_SECONDS: &str = "botbox_exec_duration_seconds";
    pub const ERRORS_TOTAL: &str = "botbox_exec_errors_total";
}

/// Version checkpoints and rollbacks.
pub mod versions {
    pub const CREATED_TOTAL: &str = "botbox_versions_created_total";
    pub const ROLLBACKS_TOTAL: &str = "botbox_versions_rollbacks_total";
    pub const CHECKPOINTS_SKIPPED_TOTAL: &str = "botbox_versions_checkpoints_skipped_total";
    pub const CREATE_DURATION_SECONDS: &str = "botbox_versions_create_duration_seconds";
}

/// Runtime backend health and networking.
pub mod runtime {
    pub const PROXY_RESTARTS_TOTAL: &str = "botbox_runtime_proxy_restarts_total";
    pub const PROXY_RESTART_FAILURES_TOTAL: &str = "botbox_runtime_proxy_restart_failures_total";
    pub const NETWORK_SETUP_RETRIES_TOTAL: &str = "botbox_runtime_network_setup_retries_total";
    pub const COMMAND_ERRORS_TOTAL: &str = "botbox_runtime_command_errors_total";
}
