//! Terminal viewer for logscope
//!
//! Renders an `OrderedLogStore` with level colors, a filter bar and a status
//! banner derived from the stream controller.

pub mod app;
pub mod config;
pub mod tui;
pub mod ui;

pub use app::{Action, Effect, LevelFilter, ViewState};
pub use config::{KeyBinding, KeyBindings, KeyContext};
pub use tui::{Event, EventHandler, Tui};
pub use ui::components::{StatusBar, log_viewer_hints};
pub use ui::screens::{LogViewerScreen, ViewHeader};
pub use ui::Theme;
