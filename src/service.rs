//! Request-level operations over the store.
//!
//! The transport hands this layer fully decoded request messages and gets
//! response messages back; nothing here knows about HTTP or encodings. `get`
//! is the interesting one: streams are grouped by the requested aggregation
//! label, each group is merged into one sorted sequence, aggregated per
//! sample interval, run through the mutation chain, and finally clipped to
//! the requested range and value cap.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::merge::{aggregate_values, group_by_label, merge_sorted, DEFAULT_SAMPLE_INTERVAL};
use crate::mutations::{mutate_values, SampleReducer};
use crate::proto::{self, stream_aggregation::AggregateType};
use crate::store::StoreManager;
use crate::variable::Variable;

pub struct StoreService {
    store: Arc<StoreManager>,
}

impl StoreService {
    pub fn new(store: Arc<StoreManager>) -> StoreService {
        StoreService { store }
    }

    /// Answers a range-and-label query, with optional aggregation and
    /// mutations applied server-side.
    pub async fn get(&self, request: proto::GetRequest) -> proto::GetResponse {
        let Some(query) = request_variable(request.variable.as_ref()) else {
            return proto::GetResponse {
                success: false,
                errormessage: Some("No variable specified".to_string()),
                stream: Vec::new(),
            };
        };

        let streams: Vec<proto::ValueStream> = self
            .store
            .get_value_streams(&query, request.min_timestamp, request.max_timestamp)
            .collect()
            .await;

        let merge_by = request
            .aggregation
            .first()
            .and_then(|aggregation| aggregation.label.first())
            .cloned()
            .unwrap_or_default();

        let mut response_streams = Vec::new();
        for group in group_by_label(streams, &merge_by) {
            let group_variable = group[0].variable.clone();
            let mut values: BoxStream<'static, proto::Value> = Box::pin(merge_sorted(group));

            if let Some(aggregation) = request.aggregation.first() {
                let aggregate = AggregateType::try_from(aggregation.r#type)
                    .unwrap_or(AggregateType::Average);
                let interval = aggregation
                    .sample_interval
                    .map(u64::from)
                    .unwrap_or(DEFAULT_SAMPLE_INTERVAL);
                values = Box::pin(aggregate_values(aggregate, interval, values));
            }
            for mutation in &request.mutation {
                let reducer = SampleReducer::from_mutation(mutation);
                let duration = u64::from(mutation.sample_frequency.unwrap_or(0));
                values = Box::pin(mutate_values(duration, values, reducer));
            }

            let mut stream = proto::ValueStream {
                variable: group_variable,
                value: Vec::new(),
            };
            while let Some(value) = values.next().await {
                if request.min_timestamp.map_or(false, |min| value.timestamp < min) {
                    continue;
                }
                if request.max_timestamp.map_or(false, |max| value.timestamp > max) {
                    continue;
                }
                stream.value.push(value);
            }

            // The cap keeps the latest values, dropping from the front.
            if let Some(max_values) = request.max_values {
                let max_values = max_values as usize;
                if stream.value.len() > max_values {
                    stream.value.drain(..stream.value.len() - max_values);
                }
            }
            response_streams.push(stream);
        }

        proto::GetResponse {
            success: true,
            errormessage: None,
            stream: response_streams,
        }
    }

    /// Accepts a batch of value streams for storage.
    pub async fn add(&self, request: proto::AddRequest) -> proto::AddResponse {
        for stream in request.stream {
            if let Err(error) = self.store.add_value_stream(stream).await {
                return proto::AddResponse {
                    success: false,
                    errormessage: Some(error.to_string()),
                };
            }
        }
        proto::AddResponse {
            success: true,
            errormessage: None,
        }
    }

    /// Lists the distinct variables matching a prefix query.
    pub async fn list(&self, request: proto::ListRequest) -> proto::ListResponse {
        let Some(query) = request_variable(request.prefix.as_ref()) else {
            return proto::ListResponse {
                success: false,
                errormessage: Some("No variable specified".to_string()),
                stream: Vec::new(),
                variable: Vec::new(),
            };
        };
        let max_variables = request.max_variables.unwrap_or(100) as usize;

        let mut variables: BTreeMap<String, proto::StreamVariable> = BTreeMap::new();
        let streams = self.store.get_value_streams(&query, None, None);
        futures::pin_mut!(streams);
        while let Some(stream) = streams.next().await {
            let Some(variable) = stream.variable else {
                continue;
            };
            variables.insert(Variable::from_proto(&variable).to_canonical(), variable);
            if max_variables > 0 && variables.len() >= max_variables {
                break;
            }
        }

        proto::ListResponse {
            success: true,
            errormessage: None,
            stream: Vec::new(),
            variable: variables.into_values().collect(),
        }
    }
}

/// A request variable is usable when present with a non-empty name.
fn request_variable(variable: Option<&proto::StreamVariable>) -> Option<Variable> {
    let parsed = Variable::from_proto(variable?);
    if parsed.name().is_empty() {
        return None;
    }
    Some(parsed)
}
