pub mod context;
pub mod driver;
pub mod shape_helpers;
pub mod spec;
