pub mod export_state;
pub mod run;
