pub mod chunkserver_impl;
pub mod chunkserver_service;
pub mod chunkserver_storage;
pub mod client;
pub mod config;
pub mod error;
pub mod master_impl;
pub mod master_service;
pub mod master_state;
pub mod master_wal;
pub mod util;

pub mod proto {
    pub mod master {
        tonic::include_proto!("master");
    }
    pub mod chunk {
        tonic::include_proto!("chunk");
    }
}
