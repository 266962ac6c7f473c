pub mod artifact;
pub mod dispatch;
pub mod downtime;
pub mod error;
pub mod event;
pub mod event_scheduler;
pub mod execution;
pub mod import;
pub mod job;
pub mod kpi;
pub mod project;
pub mod registry;
pub mod release;
pub mod rework;
pub mod rng;
pub mod run;
pub mod scenario;
pub mod simulation_engine;
pub mod timeline;
pub mod types;
pub mod validation;
