use tracing::trace;

// Trace-based counters; the Prometheus recorder only serves /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(target = "supply.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "supply.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn product_resolved(source: &'static str) {
    trace!(
        target = "supply.metrics",
        source = source,
        "products_resolved_total_inc"
    );
}

pub fn retry_wait(label: &'static str, delay_ms: u128) {
    trace!(
        target = "supply.metrics",
        call = label,
        delay_ms = delay_ms as u64,
        "retry_wait"
    );
}
