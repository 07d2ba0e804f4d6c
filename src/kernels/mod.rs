pub mod lowering;

pub use lowering::{inverse_lower_cube, lower_cube, LoweringConfig};
