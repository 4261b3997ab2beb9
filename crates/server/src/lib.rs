pub mod api;
pub mod bootstrap;
pub mod health;
pub mod notify;
pub mod providers;
pub mod runner;
pub mod worker;
