//! Wire messages of the `tollgate.admission.v1.Admission` service.
//!
//! ```text
//! service Admission {
//!   rpc Check(CheckRequest) returns (CheckResponse);
//! }
//! ```

use std::collections::HashMap;

/// One request to count and judge.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckRequest {
    /// Authenticated username; empty when the caller is anonymous
    #[prost(string, tag = "1")]
    pub principal: String,

    /// Socket peer address; the transport's remote address when empty
    #[prost(string, tag = "2")]
    pub peer_addr: String,

    /// Raw `X-Forwarded-For` header value, if any
    #[prost(string, tag = "3")]
    pub forwarded_for: String,

    /// Operation name; defaults and `limits` count per scope, empty shares
    #[prost(string, tag = "4")]
    pub scope: String,

    /// Per-operation limits on top of the process-wide defaults
    #[prost(message, repeated, tag = "5")]
    pub limits: Vec<Limit>,

    /// Skip the process-wide defaults
    #[prost(bool, tag = "6")]
    pub skip_default: bool,
}

/// `calls` requests per `period_seconds`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Limit {
    #[prost(uint64, tag = "1")]
    pub calls: u64,

    #[prost(uint64, tag = "2")]
    pub period_seconds: u64,
}

/// The binding decision for a request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckResponse {
    #[prost(enumeration = "Code", tag = "1")]
    pub code: i32,

    #[prost(uint64, tag = "2")]
    pub limit: u64,

    #[prost(uint64, tag = "3")]
    pub remaining: u64,

    /// Unix seconds at which the binding window ends
    #[prost(int64, tag = "4")]
    pub reset_at_unix: i64,

    /// Set only when `code` is `OVER_LIMIT`
    #[prost(uint64, tag = "5")]
    pub retry_after_seconds: u64,

    /// The counter store failed and the request was admitted anyway
    #[prost(bool, tag = "6")]
    pub failed_open: bool,

    /// Response headers the caller should attach
    #[prost(map = "string, string", tag = "7")]
    pub headers: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Code {
    Unknown = 0,
    Ok = 1,
    OverLimit = 2,
}

impl Code {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Code::Unknown => "UNKNOWN",
            Code::Ok => "OK",
            Code::OverLimit => "OVER_LIMIT",
        }
    }
}

include!(concat!(env!("OUT_DIR"), "/tollgate.admission.v1.Admission.rs"));
