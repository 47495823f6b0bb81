pub mod config;
pub mod crawler;
pub mod document;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod matcher;
pub mod patient;
pub mod pipeline;
pub mod priority;
pub mod record;
pub mod registry;
pub mod source;
pub mod store;
