pub mod arrears;
pub mod audit;
pub mod billing;
pub mod cron;
pub mod funds;
pub mod notifier;
pub mod payments;
pub mod settings;
pub mod uploads;
pub mod voting;
