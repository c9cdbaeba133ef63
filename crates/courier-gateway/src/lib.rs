pub mod auth;
pub mod bus;
pub mod ops;
pub mod presence;
pub mod serialize;
pub mod session;
