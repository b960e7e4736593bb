//! Per-call usage and cost accounting.
//!
//! Every service reports into one shared observer; the summary lands on the
//! session record during cleanup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::services::llm::TokenUsage;

/// USD per million prompt/completion tokens, keyed by model substring.
const LLM_RATES: [(&str, f64, f64); 5] = [
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("llama-3.3-70b", 0.59, 0.79),
    ("llama-guard", 0.20, 0.20),
    ("claude", 3.00, 15.00),
];
const LLM_DEFAULT_RATE: (f64, f64) = (1.00, 3.00);

/// USD per thousand synthesized characters.
const TTS_RATE_PER_1K_CHARS: f64 = 0.10;

/// USD per minute of transcribed audio.
const STT_RATE_PER_MINUTE: f64 = 0.0077;

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct LlmTally {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Tracks token counts and per-service cost estimates for one call.
#[derive(Debug, Default)]
pub struct UsageObserver {
    llm: Mutex<HashMap<String, LlmTally>>,
    tts_characters: AtomicU64,
    stt_audio_ms: AtomicU64,
    connected_at: Mutex<Option<Instant>>,
    ended_at: Mutex<Option<Instant>>,
}

/// Serializable usage summary for session persistence.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    /// Raw counters.
    pub usage: serde_json::Value,
    /// Per-service cost estimates in USD.
    pub costs: serde_json::Value,
    /// Total estimated cost in USD.
    pub total_cost_usd: f64,
}

impl UsageObserver {
    /// Create a fresh observer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one LLM completion's token usage.
    pub fn record_llm_usage(&self, service: &str, usage: TokenUsage) {
        if let Ok(mut map) = self.llm.lock() {
            let tally = map.entry(service.to_owned()).or_default();
            tally.prompt_tokens += usage.prompt_tokens;
            tally.completion_tokens += usage.completion_tokens;
        }
    }

    /// Record synthesized characters.
    pub fn record_tts_characters(&self, count: u64) {
        self.tts_characters.fetch_add(count, Ordering::Relaxed);
    }

    /// Record transcribed audio duration.
    pub fn record_stt_audio(&self, seconds: f64) {
        let ms = (seconds * 1000.0).max(0.0) as u64;
        self.stt_audio_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Mark the moment the call was answered.
    pub fn mark_call_connected(&self) {
        if let Ok(mut guard) = self.connected_at.lock() {
            guard.get_or_insert_with(Instant::now);
        }
    }

    /// Mark the moment the call ended.
    pub fn mark_call_ended(&self) {
        if let Ok(mut guard) = self.ended_at.lock() {
            guard.get_or_insert_with(Instant::now);
        }
    }

    /// Connected-to-ended duration in seconds, when both marks exist.
    pub fn call_duration_seconds(&self) -> Option<f64> {
        let connected = (*self.connected_at.lock().ok()?)?;
        let ended = (*self.ended_at.lock().ok()?)?;
        Some(ended.duration_since(connected).as_secs_f64())
    }

    fn llm_rate(model: &str) -> (f64, f64) {
        LLM_RATES
            .iter()
            .find(|(needle, _, _)| model.contains(needle))
            .map(|(_, p, c)| (*p, *c))
            .unwrap_or(LLM_DEFAULT_RATE)
    }

    /// Produce the `{usage, costs, total_cost_usd}` summary.
    pub fn usage_summary(&self) -> UsageSummary {
        let llm = self
            .llm
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        let tts_chars = self.tts_characters.load(Ordering::Relaxed);
        let stt_seconds = self.stt_audio_ms.load(Ordering::Relaxed) as f64 / 1000.0;

        let mut llm_cost = 0.0;
        for (service, tally) in &llm {
            let (prompt_rate, completion_rate) = Self::llm_rate(service);
            llm_cost += tally.prompt_tokens as f64 / 1_000_000.0 * prompt_rate
                + tally.completion_tokens as f64 / 1_000_000.0 * completion_rate;
        }
        let tts_cost = tts_chars as f64 / 1000.0 * TTS_RATE_PER_1K_CHARS;
        let stt_cost = stt_seconds / 60.0 * STT_RATE_PER_MINUTE;
        let total = llm_cost + tts_cost + stt_cost;

        UsageSummary {
            usage: serde_json::json!({
                "llm": llm,
                "tts_characters": tts_chars,
                "stt_audio_seconds": stt_seconds,
                "call_duration_seconds": self.call_duration_seconds(),
            }),
            costs: serde_json::json!({
                "llm": round4(llm_cost),
                "tts": round4(tts_cost),
                "stt": round4(stt_cost),
            }),
            total_cost_usd: round4(total),
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn summary_accumulates_across_services() {
        let observer = UsageObserver::new();
        observer.record_llm_usage(
            "openai:gpt-4o",
            TokenUsage {
                prompt_tokens: 1000,
                completion_tokens: 500,
            },
        );
        observer.record_llm_usage(
            "openai:gpt-4o",
            TokenUsage {
                prompt_tokens: 1000,
                completion_tokens: 500,
            },
        );
        observer.record_tts_characters(2000);
        observer.record_stt_audio(60.0);

        let summary = observer.usage_summary();
        assert_eq!(summary.usage["llm"]["openai:gpt-4o"]["prompt_tokens"], 2000);
        assert_eq!(summary.usage["tts_characters"], 2000);
        assert!(summary.total_cost_usd > 0.0);
    }

    #[test]
    fn unknown_model_uses_default_rate() {
        let observer = UsageObserver::new();
        observer.record_llm_usage(
            "custom:mystery-model",
            TokenUsage {
                prompt_tokens: 1_000_000,
                completion_tokens: 0,
            },
        );
        let summary = observer.usage_summary();
        assert!((summary.costs["llm"].as_f64().unwrap() - 1.0).abs() < 0.01);
    }

    #[test]
    fn duration_requires_both_marks() {
        let observer = UsageObserver::new();
        assert!(observer.call_duration_seconds().is_none());
        observer.mark_call_connected();
        assert!(observer.call_duration_seconds().is_none());
        observer.mark_call_ended();
        assert!(observer.call_duration_seconds().is_some());
    }

    #[test]
    fn connected_mark_is_latched() {
        let observer = UsageObserver::new();
        observer.mark_call_connected();
        let first = observer.connected_at.lock().unwrap().unwrap();
        observer.mark_call_connected();
        assert_eq!(first, observer.connected_at.lock().unwrap().unwrap());
    }
}
