pub mod calendar;
pub mod collaborators;
pub mod config;
pub mod device;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod reservation;
pub mod rules;
pub mod wal;
