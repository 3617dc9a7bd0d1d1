#![forbid(unsafe_code)]

//! Job server that fetches a single encoding of a hosted video, packs it into
//! a ZIP archive and streams progress to every connected browser.

pub mod api;
pub mod archive;
pub mod config;
pub mod extractor;
pub mod job;
pub mod notifier;
pub mod runner;
pub mod store;
pub mod validation;
