//! Sorted merging and label-keyed grouping of value streams.
//!
//! Queries fan out across the RAM map and many indexed files, so one
//! variable's data arrives as several independently-sorted streams. The
//! merge engine flattens those into a single timestamp-ordered sequence and,
//! for aggregation requests, groups streams by a label value before merging.

use std::collections::BTreeMap;

use async_stream::stream;
use futures::{pin_mut, Stream, StreamExt};

use crate::mutations::windowed;
use crate::proto::{self, stream_aggregation::AggregateType};
use crate::variable::Variable;

/// Merges pre-sorted streams into one sequence ordered by timestamp.
///
/// Ties are broken by input order, so the merge is stable with respect to
/// the order streams were supplied.
pub fn merge_sorted(streams: Vec<proto::ValueStream>) -> impl Stream<Item = proto::Value> {
    stream! {
        let mut cursors = vec![0usize; streams.len()];
        loop {
            let mut next: Option<(usize, u64)> = None;
            for (i, stream) in streams.iter().enumerate() {
                if let Some(value) = stream.value.get(cursors[i]) {
                    let earlier = match next {
                        Some((_, best)) => value.timestamp < best,
                        None => true,
                    };
                    if earlier {
                        next = Some((i, value.timestamp));
                    }
                }
            }
            let Some((i, _)) = next else {
                break;
            };
            let value = streams[i].value[cursors[i]].clone();
            cursors[i] += 1;
            yield value;
        }
    }
}

/// Groups streams by their value for `label_key`.
///
/// Streams that do not carry the label, and all streams when the key is
/// empty, are grouped by variable name instead. Each group is ready to be
/// fed to [`merge_sorted`]. Groups come back in key order.
pub fn group_by_label(
    streams: Vec<proto::ValueStream>,
    label_key: &str,
) -> Vec<Vec<proto::ValueStream>> {
    let mut groups: BTreeMap<String, Vec<proto::ValueStream>> = BTreeMap::new();
    for stream in streams {
        let key = match stream.variable.as_ref().map(Variable::from_proto) {
            Some(variable) if !label_key.is_empty() => variable
                .labels()
                .find(|(label, _)| *label == label_key)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| variable.name().to_string()),
            Some(variable) => variable.name().to_string(),
            None => String::new(),
        };
        groups.entry(key).or_default().push(stream);
    }
    groups.into_values().collect()
}

/// Default aggregation bucket width, in milliseconds.
pub const DEFAULT_SAMPLE_INTERVAL: u64 = 30_000;

/// Aggregates a merged group per `interval`-wide timestamp window.
///
/// Uses the same window rule as mutations; each non-empty window emits one
/// value timestamped at its last input.
pub fn aggregate_values<S>(
    aggregate: AggregateType,
    interval: u64,
    input: S,
) -> impl Stream<Item = proto::Value>
where
    S: Stream<Item = proto::Value>,
{
    stream! {
        let windows = windowed(interval, input);
        pin_mut!(windows);
        while let Some(window) = windows.next().await {
            let Some(last) = window.last() else {
                continue;
            };
            let timestamp = last.timestamp;
            let doubles: Vec<f64> = window
                .iter()
                .map(|v| v.double_value.unwrap_or(0.0))
                .collect();
            let result = match aggregate {
                AggregateType::Average => {
                    doubles.iter().sum::<f64>() / doubles.len() as f64
                }
                AggregateType::Max => doubles.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                AggregateType::Min => doubles.iter().copied().fold(f64::INFINITY, f64::min),
                AggregateType::Median => median(doubles),
                AggregateType::Sum => doubles.iter().sum(),
            };
            yield proto::Value::double(timestamp, result);
        }
    }
}

fn median(mut doubles: Vec<f64>) -> f64 {
    doubles.sort_by(f64::total_cmp);
    let mid = doubles.len() / 2;
    if doubles.len() % 2 == 1 {
        doubles[mid]
    } else {
        (doubles[mid - 1] + doubles[mid]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn stream_of(name: &str, labels: &str, values: &[(u64, f64)]) -> proto::ValueStream {
        let text = if labels.is_empty() {
            name.to_string()
        } else {
            format!("{name}{{{labels}}}")
        };
        let variable = Variable::parse(&text).expect("test variable should parse");
        let mut s = proto::ValueStream::new(variable.to_proto());
        s.value = values
            .iter()
            .map(|&(t, v)| proto::Value::double(t, v))
            .collect();
        s
    }

    #[tokio::test]
    async fn merge_is_ordered_by_timestamp() {
        let merged: Vec<u64> = merge_sorted(vec![
            stream_of("/a", "", &[(1, 0.0), (5, 0.0), (9, 0.0)]),
            stream_of("/b", "", &[(2, 0.0), (3, 0.0), (10, 0.0)]),
            stream_of("/c", "", &[(4, 0.0)]),
        ])
        .map(|v| v.timestamp)
        .collect()
        .await;
        assert_eq!(merged, vec![1, 2, 3, 4, 5, 9, 10]);
    }

    #[tokio::test]
    async fn merge_is_stable_on_timestamp_ties() {
        let merged: Vec<f64> = merge_sorted(vec![
            stream_of("/a", "", &[(5, 1.0)]),
            stream_of("/b", "", &[(5, 2.0)]),
            stream_of("/c", "", &[(5, 3.0)]),
        ])
        .map(|v| v.double_value.unwrap())
        .collect()
        .await;
        assert_eq!(merged, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn merge_output_is_nondecreasing_for_any_sorted_inputs() {
        let merged: Vec<u64> = merge_sorted(vec![
            stream_of("/a", "", &[(1, 0.0), (1, 0.0), (100, 0.0)]),
            stream_of("/b", "", &[(1, 0.0), (50, 0.0), (50, 0.0)]),
        ])
        .map(|v| v.timestamp)
        .collect()
        .await;
        assert!(merged.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn group_by_label_value() {
        let groups = group_by_label(
            vec![
                stream_of("/cpu", "host=a", &[]),
                stream_of("/cpu", "host=b", &[]),
                stream_of("/mem", "host=a", &[]),
            ],
            "host",
        );
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
    }

    #[test]
    fn empty_key_groups_by_name() {
        let groups = group_by_label(
            vec![
                stream_of("/cpu", "host=a", &[]),
                stream_of("/cpu", "host=b", &[]),
                stream_of("/mem", "host=a", &[]),
            ],
            "",
        );
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn missing_label_falls_back_to_name_grouping() {
        let groups = group_by_label(
            vec![
                stream_of("/cpu", "host=a", &[]),
                stream_of("/uptime", "", &[]),
            ],
            "host",
        );
        assert_eq!(groups.len(), 2);
    }

    #[tokio::test]
    async fn sum_aggregation_per_window() {
        let input = stream::iter(vec![
            proto::Value::double(0, 1.0),
            proto::Value::double(10, 2.0),
            proto::Value::double(40_000, 5.0),
        ]);
        let out: Vec<_> = aggregate_values(AggregateType::Sum, 30_000, input)
            .map(|v| (v.timestamp, v.double_value.unwrap()))
            .collect()
            .await;
        assert_eq!(out, vec![(10, 3.0), (40_000, 5.0)]);
    }

    #[tokio::test]
    async fn median_aggregation_per_window() {
        let input = stream::iter(vec![
            proto::Value::double(0, 9.0),
            proto::Value::double(1, 1.0),
            proto::Value::double(2, 4.0),
        ]);
        let out: Vec<_> = aggregate_values(AggregateType::Median, 30_000, input)
            .map(|v| v.double_value.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec![4.0]);

        let input = stream::iter(vec![
            proto::Value::double(0, 1.0),
            proto::Value::double(1, 2.0),
            proto::Value::double(2, 3.0),
            proto::Value::double(3, 10.0),
        ]);
        let out: Vec<_> = aggregate_values(AggregateType::Median, 30_000, input)
            .map(|v| v.double_value.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec![2.5]);
    }
}
