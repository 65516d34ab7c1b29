//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::admission_server::AdmissionServer;
use super::service::AdmissionServiceImpl;
use crate::error::{Result, TollgateError};
use crate::identity::IdentityResolver;
use crate::ratelimit::RateLimiter;

/// gRPC server for the admission service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    limiter: Arc<RateLimiter>,
    resolver: Arc<IdentityResolver>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>, resolver: Arc<IdentityResolver>) -> Self {
        Self {
            addr,
            limiter,
            resolver,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn service(&self) -> AdmissionServer<AdmissionServiceImpl> {
        AdmissionServer::new(AdmissionServiceImpl::new(
            self.limiter.clone(),
            self.resolver.clone(),
        ))
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.addr, "Starting gRPC server for Admission");

        Server::builder()
            .add_service(self.service())
            .serve(self.addr)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(
            addr = %self.addr,
            "Starting gRPC server for Admission with graceful shutdown"
        );

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let server = GrpcServer::new(
            addr,
            Arc::new(RateLimiter::in_memory()),
            Arc::new(IdentityResolver::new()),
        );
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_server() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = GrpcServer::new(
            addr,
            Arc::new(RateLimiter::in_memory()),
            Arc::new(IdentityResolver::new()),
        );

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            server.serve_with_shutdown(async {}),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
