mod status_bar;

pub use status_bar::{StatusBar, log_viewer_hints};
