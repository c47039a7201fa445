//! Library to back up and restore the web root and database of a web server.
//!
//! A backup stops the web services, archives the web root and dumps the
//! MySQL/MariaDB database into an artifact below the destination, verifies
//! the artifact and restarts the services before old artifacts are purged.
//! The pipeline is driven by [`pipeline::Pipeline`], the external tools are
//! located in the [`backends`] module.

#![forbid(unsafe_code)]

pub mod archive;
pub mod backends;
pub mod cli;
pub mod config;
pub mod environment;
pub mod pipeline;
pub mod report;
pub mod restore;
pub mod services;
pub mod util;
pub mod verify;
