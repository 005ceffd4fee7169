pub mod attribution;
pub mod swap_rules;
pub mod tracking;
