//! Agent workflows (spec §2 component H): long-running compositions of
//! connector operations plus an LLM analysis/report step, each driving
//! one [`crate::task::Task`] to completion.
//!
//! Grounded on `original_source/services/sniper/agent/xhs_trend.py`
//! ([`trend_analysis`]), `original_source/services/sniper/xhs_creator.py`
//! ([`creator_monitor`]), and
//! `original_source/services/sniper/agent/wechat_harvest.py` +
//! `wechat_analyze.py` ([`harvest_analyze`]).

pub mod creator_monitor;
pub mod harvest_analyze;
pub mod trend_analysis;

use std::collections::HashMap;
use serde_json::Value;

/// Shared helper: build a one-entry `log_step` input/output pair from a
/// plain message, since most steps in the source log a single status
/// string rather than a structured payload.
fn status_output(status: impl Into<String>) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    map.insert("status".to_string(), Value::String(status.into()));
    map
}
