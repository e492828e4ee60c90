//! Task and shutdown plumbing shared by the gateway's long-running services.

pub mod shutdown;
pub mod task;
