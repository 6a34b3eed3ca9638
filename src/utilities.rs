pub mod logging;
pub mod mathematics;
