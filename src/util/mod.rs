//! Small helpers shared across the stack.

pub mod minifloat;

pub use self::minifloat::Minifloat;
