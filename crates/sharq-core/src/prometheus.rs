use crate::api::BrokerStats;

/// Renders a stats snapshot in Prometheus text exposition format. The broker
/// itself carries no metrics registry; callers scrape this from whatever
/// surface they expose.
pub fn render_stats(stats: &BrokerStats, namespace: &str) -> String {
    let ns = if namespace.is_empty() {
        "sharq"
    } else {
        namespace
    };

    let mut out = String::new();
    out.push_str(&format!(
        "# HELP {ns}_enqueued_total Requests enqueued at the back\n# TYPE {ns}_enqueued_total counter\n{ns}_enqueued_total {}\n",
        stats.enqueued
    ));
    out.push_str(&format!(
        "# HELP {ns}_requeued_total Requests re-enqueued at the front after a dispatch failure\n# TYPE {ns}_requeued_total counter\n{ns}_requeued_total {}\n",
        stats.requeued
    ));
    out.push_str(&format!(
        "# HELP {ns}_dequeued_total Requests handed to workers\n# TYPE {ns}_dequeued_total counter\n{ns}_dequeued_total {}\n",
        stats.dequeued
    ));
    out.push_str(&format!(
        "# HELP {ns}_rejected_total Requests rejected at the tenant queue cap\n# TYPE {ns}_rejected_total counter\n{ns}_rejected_total {}\n",
        stats.rejected
    ));
    out.push_str(&format!(
        "# HELP {ns}_forgotten_workers_total Workers removed by the forget-delay sweep\n# TYPE {ns}_forgotten_workers_total counter\n{ns}_forgotten_workers_total {}\n",
        stats.forgotten_workers
    ));
    out.push_str(&format!(
        "# HELP {ns}_queue_len Queued requests across all tenants\n# TYPE {ns}_queue_len gauge\n{ns}_queue_len {}\n",
        stats.queue_len
    ));
    out.push_str(&format!(
        "# HELP {ns}_tenants Tenants with a queue\n# TYPE {ns}_tenants gauge\n{ns}_tenants {}\n",
        stats.tenants
    ));
    out.push_str(&format!(
        "# HELP {ns}_workers Registered workers\n# TYPE {ns}_workers gauge\n{ns}_workers {}\n",
        stats.workers
    ));

    out
}
