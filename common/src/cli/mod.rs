//! CLI policy shared by the workspace tools.

mod color;

pub use color::ColorWhen;
