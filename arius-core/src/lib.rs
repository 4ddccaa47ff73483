pub mod archive;
pub mod batch;
pub mod chunker;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod indexer;
pub mod join;
pub mod local;
pub mod localize;
pub mod model;
pub mod path_safety;
pub mod pointer;
pub mod progress;
pub mod reconcile;
pub mod repository;
pub mod restore;
pub mod retry;
pub mod rolling;
