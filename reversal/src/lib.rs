pub mod engine;
pub mod history;
pub mod model;
pub mod store;
