pub mod agent;
pub mod collector;
pub mod db;
pub mod logging;
pub mod notifications;
pub mod web;
