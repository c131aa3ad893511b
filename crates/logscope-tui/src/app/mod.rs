//! Viewer state and actions

mod action;
mod state;

pub use action::Action;
pub use state::{Effect, LevelFilter, ViewState};
