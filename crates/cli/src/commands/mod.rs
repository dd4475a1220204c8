pub mod check_config;
pub mod plugins;
pub mod registry_helper;
pub mod run;
pub mod worker;
