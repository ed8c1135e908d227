pub mod eval;
pub mod frame;
pub mod ops;
pub mod parser;
pub mod validate;

pub use eval::{evaluate, evaluate_formula, evaluate_program, BASE_COLUMNS};
pub use frame::{Frame, FrameBuilder, FrameIndex, Series};
pub use validate::validate;
