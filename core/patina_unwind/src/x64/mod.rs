pub mod capture;
pub mod context;
pub mod runtime_function;
pub mod unwind;
