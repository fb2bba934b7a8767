//! 流转指标

use attendance_core::{FlowError, Result};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// 流转引擎的 Prometheus 指标
#[derive(Clone)]
pub struct FlowMetrics {
    registry: Registry,
    transitions_total: IntCounterVec,
    rejections_total: IntCounterVec,
    pages_total: IntCounter,
    locked_swaps_total: IntCounter,
}

impl std::fmt::Debug for FlowMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowMetrics")
            .field("pages_total", &self.pages_total.get())
            .field("locked_swaps_total", &self.locked_swaps_total.get())
            .finish()
    }
}

fn metrics_error(err: prometheus::Error) -> FlowError {
    FlowError::Internal(format!("metrics: {}", err))
}

impl FlowMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new("attendance_transitions_total", "Applied flow commands"),
            &["command"],
        )
        .map_err(metrics_error)?;

        let rejections_total = IntCounterVec::new(
            Opts::new("attendance_rejections_total", "Rejected flow commands"),
            &["command", "reason"],
        )
        .map_err(metrics_error)?;

        let pages_total = IntCounter::with_opts(Opts::new("attendance_pages_total", "Page events emitted"))
            .map_err(metrics_error)?;

        let locked_swaps_total = IntCounter::with_opts(Opts::new(
            "attendance_locked_swaps_total",
            "Swap-outs ignored because of the examiner lock",
        ))
        .map_err(metrics_error)?;

        registry
            .register(Box::new(transitions_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(rejections_total.clone()))
            .map_err(metrics_error)?;
        registry.register(Box::new(pages_total.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(locked_swaps_total.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            transitions_total,
            rejections_total,
            pages_total,
            locked_swaps_total,
        })
    }

    pub fn record_transition(&self, command: &str) {
        self.transitions_total.with_label_values(&[command]).inc();
    }

    pub fn record_rejection(&self, command: &str, err: &FlowError) {
        let reason = match err {
            FlowError::InvalidTransition { .. } => "invalid_transition",
            FlowError::PreconditionFailed(_) => "precondition_failed",
            FlowError::AlreadyAdministered(_) => "already_administered",
            FlowError::ConcurrentModification { .. } => "concurrent_modification",
            FlowError::StoreUnavailable(_) => "store_unavailable",
            _ => "other",
        };
        self.rejections_total.with_label_values(&[command, reason]).inc();
    }

    pub fn record_page(&self) {
        self.pages_total.inc();
    }

    pub fn record_locked_swap(&self) {
        self.locked_swaps_total.inc();
    }

    pub fn transitions(&self, command: &str) -> u64 {
        self.transitions_total.with_label_values(&[command]).get()
    }

    pub fn pages(&self) -> u64 {
        self.pages_total.get()
    }

    pub fn locked_swaps(&self) -> u64 {
        self.locked_swaps_total.get()
    }

    /// 以 Prometheus 文本格式导出
    pub fn export(&self) -> Result<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(metrics_error)?;

        String::from_utf8(buffer).map_err(|e| FlowError::Internal(e.to_string()))
    }
}
