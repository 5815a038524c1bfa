//! Time-bucketed stream mutations.
//!
//! A mutation bins a lazy sequence of values into fixed-duration windows and
//! reduces each window to at most one output value, timestamped with the
//! last input timestamp of the window. The window boundary is set by the
//! first value of the window: a value belongs to the current window iff
//! `t < window_start + duration`, and the first value outside the window
//! both flushes it and starts the next window at its own timestamp.
//!
//! The output sequence is lazy and finite; dropping the consumer tears the
//! pipeline down without draining the input.

use async_stream::stream;
use futures::{pin_mut, Stream, StreamExt};

use crate::proto::{self, stream_mutation::SampleType};

/// One bucketed reducer, dispatched from [`proto::StreamMutation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleReducer {
    /// Arithmetic mean of the doubles in the window.
    Mean,
    /// Population standard deviation of the doubles in the window.
    StdDev,
    /// Minimum double, initialized from the first sample.
    Min,
    /// Maximum double.
    Max,
    /// `(last − first) / (last_ts − first_ts)` per millisecond. Windows with
    /// a single sample or identical endpoint timestamps produce nothing, and
    /// a negative rate is treated as a counter reset and dropped unless
    /// `signed` is set.
    Rate { signed: bool },
    /// `last − first`.
    Delta,
    /// The last value of the window, as-is.
    Latest,
    /// The last value of each window, with up to `max_gap` missing windows
    /// between two outputs filled by linear interpolation.
    Interpolate { max_gap: u32 },
}

impl SampleReducer {
    /// Maps a request mutation to its reducer. `NONE` means interpolation,
    /// matching the behavior of the query surface this store descends from.
    pub fn from_mutation(mutation: &proto::StreamMutation) -> SampleReducer {
        let max_gap = mutation.max_gap_interpolate.unwrap_or(1);
        match SampleType::try_from(mutation.sample_type).unwrap_or(SampleType::None) {
            SampleType::None => SampleReducer::Interpolate { max_gap },
            SampleType::Average => SampleReducer::Mean,
            SampleType::Max => SampleReducer::Max,
            SampleType::Min => SampleReducer::Min,
            SampleType::Rate => SampleReducer::Rate { signed: false },
            SampleType::RateSigned => SampleReducer::Rate { signed: true },
            SampleType::Delta => SampleReducer::Delta,
            SampleType::Latest => SampleReducer::Latest,
        }
    }

    /// Reduces one non-empty window to at most one value.
    fn reduce(&self, window: &[proto::Value]) -> Option<proto::Value> {
        let last = window.last()?;
        let last_timestamp = last.timestamp;
        let double_of = |v: &proto::Value| v.double_value.unwrap_or(0.0);

        let result = match self {
            SampleReducer::Mean => {
                let sum: f64 = window.iter().map(double_of).sum();
                sum / window.len() as f64
            }
            SampleReducer::StdDev => {
                let count = window.len() as f64;
                let mean = window.iter().map(double_of).sum::<f64>() / count;
                let square_sum: f64 = window
                    .iter()
                    .map(|v| {
                        let diff = double_of(v) - mean;
                        diff * diff
                    })
                    .sum();
                (square_sum / count).sqrt()
            }
            SampleReducer::Min => window.iter().map(double_of).fold(f64::INFINITY, f64::min),
            SampleReducer::Max => window
                .iter()
                .map(double_of)
                .fold(f64::NEG_INFINITY, f64::max),
            SampleReducer::Rate { signed } => {
                let first = &window[0];
                if last.timestamp == first.timestamp {
                    return None;
                }
                let rate = (double_of(last) - double_of(first))
                    / (last.timestamp - first.timestamp) as f64;
                if !signed && rate < 0.0 {
                    return None;
                }
                rate
            }
            SampleReducer::Delta => double_of(last) - double_of(&window[0]),
            SampleReducer::Latest | SampleReducer::Interpolate { .. } => {
                return Some(last.clone());
            }
        };
        Some(proto::Value::double(last_timestamp, result))
    }
}

/// Splits a timestamp-ordered sequence into `duration`-wide windows.
///
/// The first value of each window sets its start; the first value at or past
/// `start + duration` closes the window and opens the next one.
pub(crate) fn windowed<S>(duration: u64, input: S) -> impl Stream<Item = Vec<proto::Value>>
where
    S: Stream<Item = proto::Value>,
{
    stream! {
        pin_mut!(input);
        let mut window: Vec<proto::Value> = Vec::new();
        let mut window_start: Option<u64> = None;

        while let Some(value) = input.next().await {
            match window_start {
                Some(start) if value.timestamp < start + duration => {}
                Some(_) => {
                    yield std::mem::take(&mut window);
                    window_start = Some(value.timestamp);
                }
                None => window_start = Some(value.timestamp),
            }
            window.push(value);
        }
        if !window.is_empty() {
            yield window;
        }
    }
}

/// Applies `reducer` over `duration`-wide windows of `input`.
///
/// `input` must be ordered by timestamp. One output is produced per
/// non-empty window, timestamped at the window's last input.
pub fn mutate_values<S>(
    duration: u64,
    input: S,
    reducer: SampleReducer,
) -> impl Stream<Item = proto::Value>
where
    S: Stream<Item = proto::Value>,
{
    stream! {
        let windows = windowed(duration, input);
        pin_mut!(windows);
        let mut previous: Option<proto::Value> = None;

        while let Some(window) = windows.next().await {
            let Some(current) = reducer.reduce(&window) else {
                continue;
            };
            if let SampleReducer::Interpolate { max_gap } = reducer {
                if let Some(prev) = previous.as_ref() {
                    for fill in interpolate_gap(prev, &current, duration, max_gap) {
                        yield fill;
                    }
                }
            }
            previous = Some(current.clone());
            yield current;
        }
    }
}

/// Linearly fills windows missing between two interpolation outputs.
///
/// Produces one value per whole `duration` step strictly between `prev` and
/// `current`, but only when the number of missing windows is within
/// `max_gap`.
fn interpolate_gap(
    prev: &proto::Value,
    current: &proto::Value,
    duration: u64,
    max_gap: u32,
) -> Vec<proto::Value> {
    if duration == 0 {
        return Vec::new();
    }
    let span = current.timestamp.saturating_sub(prev.timestamp);
    if span <= duration {
        return Vec::new();
    }
    let missing = span / duration - u64::from(span % duration == 0);
    if missing == 0 || missing > u64::from(max_gap) {
        return Vec::new();
    }

    let (Some(v0), Some(v1)) = (prev.double_value, current.double_value) else {
        return Vec::new();
    };
    let slope = (v1 - v0) / span as f64;
    (1..=missing)
        .map(|step| {
            let offset = step * duration;
            proto::Value::double(prev.timestamp + offset, v0 + slope * offset as f64)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn input_values() -> Vec<proto::Value> {
        [
            (1, 2.0),
            (2, 4.0),
            (3, 4.0),
            (3, 4.0),
            (5, 5.0),
            (6, 5.0),
            (7, 7.0),
            (8, 9.0),
            (101, 4.0),
            (155, 99.0),
        ]
        .into_iter()
        .map(|(t, v)| proto::Value::double(t, v))
        .collect()
    }

    async fn mutate(reducer: SampleReducer, duration: u64) -> Vec<(u64, f64)> {
        mutate_values(duration, stream::iter(input_values()), reducer)
            .map(|v| (v.timestamp, v.double_value.unwrap()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn mean_over_hundred_ms_windows() {
        assert_eq!(
            mutate(SampleReducer::Mean, 100).await,
            vec![(8, 5.0), (155, 51.5)]
        );
    }

    #[tokio::test]
    async fn stddev_over_hundred_ms_windows() {
        assert_eq!(
            mutate(SampleReducer::StdDev, 100).await,
            vec![(8, 2.0), (155, 47.5)]
        );
    }

    #[tokio::test]
    async fn max_over_hundred_ms_windows() {
        assert_eq!(
            mutate(SampleReducer::Max, 100).await,
            vec![(8, 9.0), (155, 99.0)]
        );
    }

    #[tokio::test]
    async fn min_initializes_from_the_first_sample() {
        // All-positive input: a zero-initialized minimum would report 0.
        assert_eq!(
            mutate(SampleReducer::Min, 100).await,
            vec![(8, 2.0), (155, 4.0)]
        );
    }

    #[tokio::test]
    async fn rate_over_hundred_ms_windows() {
        assert_eq!(
            mutate(SampleReducer::Rate { signed: false }, 100).await,
            vec![(8, 1.0), (155, 1.7592592592592593)]
        );
    }

    #[tokio::test]
    async fn rate_emits_nothing_for_single_sample_windows() {
        let input = stream::iter(vec![
            proto::Value::double(10, 5.0),
            proto::Value::double(500, 9.0),
        ]);
        let out: Vec<_> = mutate_values(100, input, SampleReducer::Rate { signed: false })
            .collect()
            .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn unsigned_rate_drops_counter_resets() {
        let input = stream::iter(vec![
            proto::Value::double(1, 100.0),
            proto::Value::double(50, 2.0),
        ]);
        let unsigned: Vec<_> =
            mutate_values(100, input, SampleReducer::Rate { signed: false })
                .collect()
                .await;
        assert!(unsigned.is_empty());

        let input = stream::iter(vec![
            proto::Value::double(1, 100.0),
            proto::Value::double(50, 2.0),
        ]);
        let signed: Vec<_> = mutate_values(100, input, SampleReducer::Rate { signed: true })
            .map(|v| v.double_value.unwrap())
            .collect()
            .await;
        assert_eq!(signed, vec![-2.0]);
    }

    #[tokio::test]
    async fn delta_is_last_minus_first() {
        assert_eq!(
            mutate(SampleReducer::Delta, 100).await,
            vec![(8, 7.0), (155, 95.0)]
        );
    }

    #[tokio::test]
    async fn window_outputs_carry_the_last_input_timestamp() {
        // A new window begins at the first out-of-window value.
        let input = stream::iter(vec![
            proto::Value::double(10, 1.0),
            proto::Value::double(109, 2.0),
            proto::Value::double(110, 3.0),
            proto::Value::double(209, 4.0),
        ]);
        let out: Vec<_> = mutate_values(100, input, SampleReducer::Latest)
            .map(|v| v.timestamp)
            .collect()
            .await;
        assert_eq!(out, vec![109, 209]);
    }

    #[tokio::test]
    async fn interpolate_fills_a_single_missing_window() {
        let input = stream::iter(vec![
            proto::Value::double(0, 10.0),
            proto::Value::double(200, 30.0),
        ]);
        let out: Vec<_> = mutate_values(100, input, SampleReducer::Interpolate { max_gap: 1 })
            .map(|v| (v.timestamp, v.double_value.unwrap()))
            .collect()
            .await;
        assert_eq!(out, vec![(0, 10.0), (100, 20.0), (200, 30.0)]);
    }

    #[tokio::test]
    async fn interpolate_leaves_wide_gaps_alone() {
        let input = stream::iter(vec![
            proto::Value::double(0, 10.0),
            proto::Value::double(500, 30.0),
        ]);
        let out: Vec<_> = mutate_values(100, input, SampleReducer::Interpolate { max_gap: 1 })
            .map(|v| v.timestamp)
            .collect()
            .await;
        assert_eq!(out, vec![0, 500]);
    }

    #[tokio::test]
    async fn latest_preserves_string_values() {
        let input = stream::iter(vec![
            proto::Value::string(1, "starting"),
            proto::Value::string(5, "running"),
        ]);
        let out: Vec<_> = mutate_values(100, input, SampleReducer::Latest)
            .collect()
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].string_value.as_deref(), Some("running"));
    }
}
