pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod keys;
pub mod model;
pub mod retry;
pub mod signatures;
pub mod store;
pub mod validator;
