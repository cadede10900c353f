/*!
Metric definitions for the VM serializer.
*/

// Counters, work queue.
pub(crate) static METRIC_OPS_ENQUEUED: &str = "gode_ops_enqueued_total";
pub(crate) static METRIC_OPS_COMPLETED: &str = "gode_ops_completed_total";
pub(crate) static METRIC_OPS_DROPPED: &str = "gode_ops_dropped_total";

// Counters, VM lifecycle.
pub(crate) static METRIC_VMS_STARTED: &str = "gode_vms_started_total";
pub(crate) static METRIC_VMS_DISPOSED: &str = "gode_vms_disposed_total";
