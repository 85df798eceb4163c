pub mod activity_instance;
pub mod context;
pub mod engine;
pub mod execution;
pub mod history;
pub mod instance;
pub mod interpreter;
pub mod job;
pub mod listener;
pub mod node;
pub mod operation;
pub mod records;
pub mod services;
pub mod storage;
pub mod tree;
