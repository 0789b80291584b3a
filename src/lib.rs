pub mod core;
pub mod native_interface;
pub mod pointer_scan;
