//! Control Plane Communication

pub mod enroll;
pub mod protocol;
pub mod session;
