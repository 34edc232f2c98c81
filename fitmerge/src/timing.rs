use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::{TimingMode, TimingOptions};
use crate::fit::{self, mesg, Record};

/// How the span duration was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanSource {
    Exact,
    Estimated,
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RecordingSpan {
    pub duration_seconds: u32,
    pub total_record_count: usize,
    /// FIT timestamp of the first timed message.
    pub start_timestamp: Option<u32>,
    pub source: SpanSource,
}

impl RecordingSpan {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_timestamp.and_then(fit::to_datetime)
    }
}

fn bounds(timestamps: impl Iterator<Item = u32>) -> Option<(u32, u32)> {
    timestamps.fold(None, |acc, ts| match acc {
        None => Some((ts, ts)),
        Some((first, last)) => Some((first.min(ts), last.max(ts))),
    })
}

/// Derive the workout span from a cleaned record stream.
pub fn extract_span(records: &[Record], options: &TimingOptions) -> RecordingSpan {
    let total_record_count = records.len();
    let samples = bounds(
        records
            .iter()
            .filter(|r| r.global_number() == mesg::RECORD)
            .filter_map(Record::timestamp),
    );
    let span = samples.or_else(|| bounds(records.iter().filter_map(Record::timestamp)));

    let Some((first, last)) = span else {
        debug!(
            duration = options.fallback_duration_seconds,
            "no timestamps, using fallback duration"
        );
        return RecordingSpan {
            duration_seconds: options.fallback_duration_seconds.max(1),
            total_record_count,
            start_timestamp: None,
            source: SpanSource::Fallback,
        };
    };

    if options.mode == TimingMode::Exact && last > first {
        return RecordingSpan {
            duration_seconds: last - first,
            total_record_count,
            start_timestamp: Some(first),
            source: SpanSource::Exact,
        };
    }

    let count = u32::try_from(total_record_count).unwrap_or(u32::MAX);
    let estimate = count.saturating_mul(options.seconds_per_record);
    let duration_seconds = options.estimate_floor_seconds.max(estimate).max(1);
    debug!(duration_seconds, records = total_record_count, "estimated workout duration");
    RecordingSpan {
        duration_seconds,
        total_record_count,
        start_timestamp: Some(first),
        source: SpanSource::Estimated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn exact_span_uses_sample_timestamps() {
        let records = vec![
            fixtures::file_id(),
            fixtures::sample(fixtures::START + 5, 90),
            fixtures::sample(fixtures::START + 125, 95),
            fixtures::session(fixtures::START, fixtures::START + 400),
        ];
        let span = extract_span(&records, &TimingOptions::default());
        assert_eq!(span.source, SpanSource::Exact);
        assert_eq!(span.duration_seconds, 120);
        assert_eq!(span.start_timestamp, Some(fixtures::START + 5));
        assert_eq!(span.total_record_count, 4);
    }

    #[test]
    fn falls_back_to_any_timestamp() {
        let records = vec![fixtures::lap(fixtures::START), fixtures::activity(fixtures::START + 60)];
        let span = extract_span(&records, &TimingOptions::default());
        assert_eq!(span.source, SpanSource::Exact);
        assert_eq!(span.duration_seconds, 60);
    }

    #[test]
    fn estimate_mode_applies_floor() {
        let options = TimingOptions {
            mode: TimingMode::Estimate,
            ..TimingOptions::default()
        };
        let short = fixtures::strength_recording(10, 0).records;
        assert_eq!(extract_span(&short, &options).duration_seconds, 1800);

        let long = fixtures::strength_recording(300, 0).records;
        let span = extract_span(&long, &options);
        assert_eq!(span.source, SpanSource::Estimated);
        assert_eq!(span.duration_seconds, 304 * 10);
    }

    #[test]
    fn zero_length_span_is_estimated() {
        let records = vec![fixtures::sample(fixtures::START, 90)];
        let span = extract_span(&records, &TimingOptions::default());
        assert_eq!(span.source, SpanSource::Estimated);
        assert_eq!(span.duration_seconds, 1800);
    }

    #[test]
    fn no_timestamps_uses_fallback() {
        let span = extract_span(&[fixtures::file_id()], &TimingOptions::default());
        assert_eq!(span.source, SpanSource::Fallback);
        assert_eq!(span.duration_seconds, 3600);
        assert_eq!(span.start_time(), None);
    }
}
