pub mod agent_service;
pub mod alert_service;
pub mod report_service;
pub mod webhook_service;
