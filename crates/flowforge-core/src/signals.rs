//! Log-window signal analysis.
//!
//! The monitor keeps a sliding window of recent (redacted) output lines
//! and derives four signals from it: Shannon entropy over the byte
//! distribution, the maximum n-gram repetition ratio, the raw
//! unique-line diversity, and a progress recognizer that spots healthy
//! workloads emitting monotonically advancing counters. The decider uses
//! these to separate an infinite loop from a busy-but-progressing run.

use regex::Regex;
use std::sync::OnceLock;

/// Number of bits of entropy a uniformly random byte stream carries;
/// used to project raw entropy onto the 0..100 score scale.
const MAX_BYTE_ENTROPY_BITS: f64 = 8.0;

/// Token n-gram width used for the repetition ratio.
const NGRAM_WIDTH: usize = 3;

/// Minimum monotonic samples before the progress recognizer fires.
const MIN_PROGRESS_SAMPLES: usize = 3;

/// Signals derived from one window of output lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogWindowStats {
    /// Shannon entropy in bits per byte (0..=8).
    pub entropy_bits: f64,
    /// Entropy projected onto 0..100.
    pub entropy_score: f64,
    /// Max n-gram (and whole-line) repetition ratio, 0..=1.
    pub repetition_ratio: f64,
    /// Unique-line / total-line ratio, 0..=1.
    pub raw_diversity: f64,
    /// Whether the window looks like a progressing workload.
    pub progress_like: bool,
}

impl LogWindowStats {
    /// Stats for an empty window: nothing observed, nothing suspicious.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entropy_bits: 0.0,
            entropy_score: 0.0,
            repetition_ratio: 0.0,
            raw_diversity: 1.0,
            progress_like: false,
        }
    }
}

/// Analyzes a window of output lines.
#[must_use]
pub fn analyze(lines: &[String]) -> LogWindowStats {
    if lines.is_empty() {
        return LogWindowStats::empty();
    }

    let entropy_bits = shannon_entropy_bits(lines);
    let entropy_score = (entropy_bits / MAX_BYTE_ENTROPY_BITS * 100.0).clamp(0.0, 100.0);

    LogWindowStats {
        entropy_bits,
        entropy_score,
        repetition_ratio: repetition_ratio(lines),
        raw_diversity: raw_diversity(lines),
        progress_like: progress_like(lines),
    }
}

/// Shannon entropy of the byte distribution across all lines, in bits.
#[must_use]
pub fn shannon_entropy_bits(lines: &[String]) -> f64 {
    let mut counts = [0u64; 256];
    let mut total = 0u64;
    for line in lines {
        for b in line.as_bytes() {
            counts[*b as usize] += 1;
            total += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    let total_f = total as f64;
    let mut entropy = 0.0;
    for count in counts {
        if count == 0 {
            continue;
        }
        let p = count as f64 / total_f;
        entropy -= p * p.log2();
    }
    entropy
}

/// Unique-line / total-line ratio over the window.
#[must_use]
pub fn raw_diversity(lines: &[String]) -> f64 {
    if lines.is_empty() {
        return 1.0;
    }
    let mut seen: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        let trimmed = line.trim();
        if !seen.contains(&trimmed) {
            seen.push(trimmed);
        }
    }
    seen.len() as f64 / lines.len() as f64
}

/// Maximum repetition ratio over whole lines and token n-grams.
///
/// The line component is the share of the window taken by its most
/// frequent line; the n-gram component is the share of token trigrams
/// that occur more than once. A tight loop printing one message scores
/// 1.0 on the first; a loop that only varies a counter still scores high
/// on the second.
#[must_use]
pub fn repetition_ratio(lines: &[String]) -> f64 {
    let line_ratio = if lines.len() >= 2 {
        max_frequency_ratio(lines.iter().map(|l| l.trim().to_string()))
    } else {
        0.0
    };

    let tokens: Vec<&str> = lines
        .iter()
        .flat_map(|l| l.split_whitespace())
        .collect();
    let ngram_ratio = if tokens.len() > NGRAM_WIDTH {
        repeated_mass_ratio(tokens.windows(NGRAM_WIDTH).map(|w| w.join(" ")))
    } else {
        0.0
    };

    line_ratio.max(ngram_ratio)
}

fn count_items<I: Iterator<Item = String>>(
    items: I,
) -> (std::collections::HashMap<String, usize>, usize) {
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut total = 0usize;
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
        total += 1;
    }
    (counts, total)
}

fn max_frequency_ratio<I: Iterator<Item = String>>(items: I) -> f64 {
    let (counts, total) = count_items(items);
    if total == 0 {
        return 0.0;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    max as f64 / total as f64
}

fn repeated_mass_ratio<I: Iterator<Item = String>>(items: I) -> f64 {
    let (counts, total) = count_items(items);
    if total == 0 {
        return 0.0;
    }
    let repeated: usize = counts.values().filter(|c| **c > 1).sum();
    repeated as f64 / total as f64
}

fn progress_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)\b(?:step|epoch|iter(?:ation)?|batch|round)[=\s:#]+(\d+)").unwrap(),
            Regex::new(r"(\d+(?:\.\d+)?)\s*%").unwrap(),
            Regex::new(r"\b(\d+)\s*/\s*\d+\b").unwrap(),
            Regex::new(r"(?i)\bmetric[=\s:]+(\d+(?:\.\d+)?)").unwrap(),
        ]
    })
}

/// Recognizes progressing output: a numeric field advancing monotonically
/// across the window, or stable per-step prefixes with growing counters.
#[must_use]
pub fn progress_like(lines: &[String]) -> bool {
    for pattern in progress_patterns() {
        let values: Vec<f64> = lines
            .iter()
            .filter_map(|line| {
                pattern
                    .captures(line)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<f64>().ok())
            })
            .collect();
        if values.len() >= MIN_PROGRESS_SAMPLES && is_advancing(&values) {
            return true;
        }
    }
    false
}

/// Non-decreasing with at least one strict increase.
fn is_advancing(values: &[f64]) -> bool {
    let mut strictly_increased = false;
    for pair in values.windows(2) {
        if pair[1] < pair[0] {
            return false;
        }
        if pair[1] > pair[0] {
            strictly_increased = true;
        }
    }
    strictly_increased
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(samples: &[&str]) -> Vec<String> {
        samples.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn empty_window_is_neutral() {
        let stats = analyze(&[]);
        assert_eq!(stats, LogWindowStats::empty());
    }

    #[test]
    fn identical_lines_score_full_repetition() {
        let window = lines(&["processing request 4242 failed, retrying endlessly"; 10]);
        let stats = analyze(&window);
        assert!((stats.repetition_ratio - 1.0).abs() < f64::EPSILON);
        assert!((stats.raw_diversity - 0.1).abs() < 1e-9);
        assert!(!stats.progress_like);
    }

    #[test]
    fn advancing_step_counter_is_progress() {
        let window: Vec<String> = (1..=10)
            .map(|i| format!("progress step={i} phase=compute metric=0.90{i}"))
            .collect();
        let stats = analyze(&window);
        assert!(stats.progress_like);
        assert!(stats.raw_diversity >= 0.99);
    }

    #[test]
    fn regressing_counter_is_not_progress() {
        let window = lines(&["step=5 ok", "step=4 ok", "step=3 ok", "step=2 ok"]);
        assert!(!progress_like(&window));
    }

    #[test]
    fn flat_counter_is_not_progress() {
        let window = lines(&["step=7", "step=7", "step=7", "step=7"]);
        assert!(!progress_like(&window));
    }

    #[test]
    fn percent_counter_is_progress() {
        let window = lines(&["downloading 10%", "downloading 35%", "downloading 80%"]);
        assert!(progress_like(&window));
    }

    #[test]
    fn fraction_counter_is_progress() {
        let window = lines(&["shard 1/8 done", "shard 2/8 done", "shard 5/8 done"]);
        assert!(progress_like(&window));
    }

    #[test]
    fn entropy_orders_repetitive_below_varied() {
        let repetitive = lines(&["aaaa aaaa aaaa"; 10]);
        let varied: Vec<String> = (0..10)
            .map(|i| format!("line {i} with distinct content {}", i * 31))
            .collect();
        assert!(shannon_entropy_bits(&repetitive) < shannon_entropy_bits(&varied));
    }

    #[test]
    fn ngram_repetition_catches_rephrased_loops() {
        // Same body, varying counter: line-level diversity is high but the
        // trigram ratio stays elevated.
        let window: Vec<String> = (0..10)
            .map(|i| format!("retrying connection to upstream shard now attempt {i}"))
            .collect();
        let stats = analyze(&window);
        assert!(stats.repetition_ratio > 0.5, "{}", stats.repetition_ratio);
    }
}
