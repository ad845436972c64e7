pub mod bridge;
pub mod daemon;
pub mod gateway;
pub mod status;
pub mod stop;
