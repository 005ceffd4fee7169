pub mod traffic_classifier;
pub mod rule_evaluator;
pub mod session_service;
pub mod session_sweeper;
