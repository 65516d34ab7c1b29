//! gRPC front end: lets other processes ask this limiter for admission.

pub mod proto;
mod server;
mod service;

pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;

pub use proto::admission_server::AdmissionServer;
pub use proto::{CheckRequest, CheckResponse, Code, Limit};
