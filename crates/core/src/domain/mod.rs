pub mod agent;
pub mod chain;
pub mod contact;
pub mod execution;
pub mod loadout;
