//! Wire schema for on-disk records and the request/response envelopes.
//!
//! These message definitions are maintained by hand in the shape `prost`
//! generates for a proto2 schema: optional fields throughout, explicit tags,
//! and accessor methods that substitute the field default. The tags are
//! wire-compatible with the original `openinstrument.proto` schema, including
//! a few retired field numbers that are deliberately skipped.
//!
//! # Warning
//!
//! `StoreFileHeaderIndex.offset` must stay `fixed64`. Indexed store files are
//! written header-first with zero offsets and the header is rewritten in
//! place once the body offsets are known; a varint offset would change the
//! header's encoded length between the two writes and corrupt the file.

/// A single `label=value` pair attached to a stream variable.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Label {
    #[prost(string, required, tag = "1")]
    pub label: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "2")]
    pub value: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamVariable {
    #[prost(string, required, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub label: ::prost::alloc::vec::Vec<Label>,
    #[prost(enumeration = "stream_variable::ValueType", optional, tag = "3")]
    pub r#type: ::core::option::Option<i32>,
}

pub mod stream_variable {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum ValueType {
        Unknown = 0,
        Gauge = 1,
        Rate = 2,
    }
}

/// One sample. Exactly one of `double_value`/`string_value` is meaningful.
///
/// `end_timestamp` run-length encodes a repeated value: the sample covers
/// `[timestamp, end_timestamp]`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Value {
    #[prost(uint64, required, tag = "1")]
    pub timestamp: u64,
    #[prost(double, optional, tag = "2")]
    pub double_value: ::core::option::Option<f64>,
    #[prost(string, optional, tag = "3")]
    pub string_value: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(uint64, optional, tag = "4")]
    pub end_timestamp: ::core::option::Option<u64>,
    #[prost(message, optional, tag = "5")]
    pub variable: ::core::option::Option<StreamVariable>,
}

/// Time-ordered values for one variable.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueStream {
    #[prost(message, optional, tag = "2")]
    pub variable: ::core::option::Option<StreamVariable>,
    #[prost(message, repeated, tag = "4")]
    pub value: ::prost::alloc::vec::Vec<Value>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamMutation {
    #[prost(enumeration = "stream_mutation::SampleType", required, tag = "1")]
    pub sample_type: i32,
    #[prost(uint32, optional, tag = "2")]
    pub sample_frequency: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "3", default = "1")]
    pub max_gap_interpolate: ::core::option::Option<u32>,
}

pub mod stream_mutation {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum SampleType {
        None = 0,
        Average = 1,
        Max = 2,
        Min = 3,
        Rate = 4,
        RateSigned = 5,
        Delta = 6,
        Latest = 7,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamAggregation {
    #[prost(enumeration = "stream_aggregation::AggregateType", required, tag = "1")]
    pub r#type: i32,
    #[prost(string, repeated, tag = "2")]
    pub label: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(uint32, optional, tag = "3", default = "30000")]
    pub sample_interval: ::core::option::Option<u32>,
}

pub mod stream_aggregation {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum AggregateType {
        Average = 0,
        Max = 1,
        Min = 2,
        Median = 3,
        Sum = 4,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRequest {
    #[prost(message, optional, tag = "9")]
    pub variable: ::core::option::Option<StreamVariable>,
    #[prost(uint64, optional, tag = "2")]
    pub min_timestamp: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub max_timestamp: ::core::option::Option<u64>,
    #[prost(message, repeated, tag = "6")]
    pub mutation: ::prost::alloc::vec::Vec<StreamMutation>,
    #[prost(message, repeated, tag = "7")]
    pub aggregation: ::prost::alloc::vec::Vec<StreamAggregation>,
    #[prost(uint32, optional, tag = "8", default = "100")]
    pub max_variables: ::core::option::Option<u32>,
    #[prost(bool, optional, tag = "10", default = "false")]
    pub forwarded: ::core::option::Option<bool>,
    #[prost(uint32, optional, tag = "11")]
    pub max_values: ::core::option::Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetResponse {
    #[prost(bool, required, tag = "1")]
    pub success: bool,
    #[prost(string, optional, tag = "2")]
    pub errormessage: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "3")]
    pub stream: ::prost::alloc::vec::Vec<ValueStream>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddRequest {
    #[prost(message, repeated, tag = "1")]
    pub stream: ::prost::alloc::vec::Vec<ValueStream>,
    #[prost(bool, optional, tag = "2", default = "false")]
    pub forwarded: ::core::option::Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddResponse {
    #[prost(bool, required, tag = "1")]
    pub success: bool,
    #[prost(string, optional, tag = "2")]
    pub errormessage: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRequest {
    #[prost(message, optional, tag = "3")]
    pub prefix: ::core::option::Option<StreamVariable>,
    #[prost(uint32, optional, tag = "2", default = "100")]
    pub max_variables: ::core::option::Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListResponse {
    #[prost(bool, required, tag = "1")]
    pub success: bool,
    #[prost(string, optional, tag = "2")]
    pub errormessage: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "3")]
    pub stream: ::prost::alloc::vec::Vec<ValueStream>,
    #[prost(message, repeated, tag = "4")]
    pub variable: ::prost::alloc::vec::Vec<StreamVariable>,
}

/// First record of every indexed store file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreFileHeader {
    #[prost(uint64, required, tag = "1")]
    pub start_timestamp: u64,
    #[prost(uint64, required, tag = "2")]
    pub end_timestamp: u64,
    #[prost(message, repeated, tag = "4")]
    pub variable: ::prost::alloc::vec::Vec<StreamVariable>,
    #[prost(message, repeated, tag = "5")]
    pub index: ::prost::alloc::vec::Vec<StoreFileHeaderIndex>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreFileHeaderIndex {
    #[prost(message, required, tag = "1")]
    pub variable: StreamVariable,
    #[prost(fixed64, required, tag = "2")]
    pub offset: u64,
}

impl Value {
    /// A double-valued sample at a single timestamp.
    pub fn double(timestamp: u64, value: f64) -> Self {
        Value {
            timestamp,
            double_value: Some(value),
            ..Default::default()
        }
    }

    /// A string-valued sample at a single timestamp.
    pub fn string(timestamp: u64, value: impl Into<String>) -> Self {
        Value {
            timestamp,
            string_value: Some(value.into()),
            ..Default::default()
        }
    }

    /// The timestamp of the last instant this sample covers.
    pub fn last_timestamp(&self) -> u64 {
        self.end_timestamp.unwrap_or(self.timestamp)
    }
}

impl ValueStream {
    pub fn new(variable: StreamVariable) -> Self {
        ValueStream {
            variable: Some(variable),
            value: Vec::new(),
        }
    }
}
