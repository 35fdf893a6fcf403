pub mod calibration;
pub mod models;
pub mod settings;
