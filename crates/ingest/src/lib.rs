//! Appstore ingest: consume deployment lifecycle messages from the broker
//! and turn them into `AppDeployment` record mutations; publish status
//! updates back.

#![forbid(unsafe_code)]

mod consumer;
mod dispatch;
mod handler;
mod publisher;

pub use consumer::{Consumer, ConsumerConfig};
pub use dispatch::{dispatch, Outcome};
pub use handler::{DeploymentHandler, Disposition, HandleError, MessageHandler};
pub use publisher::{Publisher, StatusPublisher};
