use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// Content type of [`encode_text`] output, for whatever serves it.
pub fn content_type() -> &'static str {
    prometheus::TEXT_FORMAT
}

/// Render every registered metric in the Prometheus text exposition format.
///
/// Serving it over HTTP is left to the host service.
pub fn encode_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
