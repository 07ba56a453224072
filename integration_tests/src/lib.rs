//! Test fixtures for exercising the opencan client against simulated devices
pub mod sim_bus;
pub mod sim_device;
