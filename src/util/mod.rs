pub mod quat;
pub mod vec2;
pub mod wrapping;
