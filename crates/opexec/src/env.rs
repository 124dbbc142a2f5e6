use std::env;
use std::sync::OnceLock;

static OPEXEC_COLLECT_COUNTERS: OnceLock<bool> = OnceLock::new();
static OPEXEC_IMPL_FILTER: OnceLock<Option<String>> = OnceLock::new();
static OPEXEC_FC_SPARSE_RATE: OnceLock<f32> = OnceLock::new();

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn parse_rate(value: &str) -> Option<f32> {
    let rate = value.trim().parse::<f32>().ok()?;
    if (0.0..=1.0).contains(&rate) {
        Some(rate)
    } else {
        None
    }
}

pub(crate) fn collect_counters() -> bool {
    *OPEXEC_COLLECT_COUNTERS.get_or_init(|| match env::var("OPEXEC_COLLECT_COUNTERS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn implementation_filter() -> Option<String> {
    OPEXEC_IMPL_FILTER
        .get_or_init(|| match env::var("OPEXEC_IMPL_FILTER") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => None,
        })
        .clone()
}

/// Minimum ratio of zero weights required before sparse decompression kicks in.
/// `1.0` disables sparse weights entirely.
pub(crate) fn fc_sparse_rate() -> f32 {
    *OPEXEC_FC_SPARSE_RATE.get_or_init(|| {
        env::var("OPEXEC_FC_SPARSE_RATE")
            .ok()
            .and_then(|value| parse_rate(&value))
            .unwrap_or(1.0)
    })
}
