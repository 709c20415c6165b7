pub mod cancel;
pub mod catalog;
pub mod config;
pub mod crawler;
pub mod error;
pub mod graph;
pub mod http;
pub mod lifecycle;
pub mod mediawiki;
pub mod merge;
pub mod names;
pub mod page_cache;
pub mod pipeline;
pub mod runtime;
pub mod tasks_api;
pub mod wikitext;

#[cfg(test)]
mod test_support;
