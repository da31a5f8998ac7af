pub mod backend;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod demand;
pub mod epoch;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod observer;
pub mod planner;
pub mod pool_sync;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod state;
