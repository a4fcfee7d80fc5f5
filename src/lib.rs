pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod rpc;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod tls;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("dispatch");
}
