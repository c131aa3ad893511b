use ratatui::style::{Color, Modifier, Style};

use logscope_types::LogLevel;

/// Color theme for the viewer
pub struct Theme;

impl Theme {
    pub const BG: Color = Color::Reset;
    pub const FG: Color = Color::White;
    pub const FG_DIM: Color = Color::DarkGray;

    pub const PRIMARY: Color = Color::Cyan;
    pub const HIGHLIGHT: Color = Color::Yellow;

    pub const SUCCESS: Color = Color::Green;
    pub const WARNING: Color = Color::Yellow;
    pub const ERROR: Color = Color::Red;

    // Log level colors
    pub const LOG_TRACE: Color = Color::DarkGray;
    pub const LOG_DEBUG: Color = Color::Cyan;
    pub const LOG_INFO: Color = Color::Green;
    pub const LOG_WARN: Color = Color::Yellow;
    pub const LOG_ERROR: Color = Color::Red;
    pub const LOG_FATAL: Color = Color::Magenta;

    pub fn level_color(level: LogLevel) -> Color {
        match level {
            LogLevel::Trace => Self::LOG_TRACE,
            LogLevel::Debug => Self::LOG_DEBUG,
            LogLevel::Info => Self::LOG_INFO,
            LogLevel::Warn => Self::LOG_WARN,
            LogLevel::Error => Self::LOG_ERROR,
            LogLevel::Fatal => Self::LOG_FATAL,
            LogLevel::Unknown => Self::FG_DIM,
        }
    }

    /// Message text style by level
    pub fn level_text(level: LogLevel) -> Style {
        match level {
            LogLevel::Error | LogLevel::Fatal => Style::default().fg(Self::ERROR),
            LogLevel::Warn => Style::default().fg(Self::WARNING),
            _ => Style::default().fg(Self::FG),
        }
    }

    pub fn border() -> Style {
        Style::default().fg(Self::FG_DIM)
    }

    pub fn title() -> Style {
        Style::default()
            .fg(Self::PRIMARY)
            .add_modifier(Modifier::BOLD)
    }

    pub fn text() -> Style {
        Style::default().fg(Self::FG)
    }

    pub fn text_dim() -> Style {
        Style::default().fg(Self::FG_DIM)
    }

    pub fn text_highlight() -> Style {
        Style::default()
            .fg(Self::HIGHLIGHT)
            .add_modifier(Modifier::BOLD)
    }

    /// Search match inside a log line
    pub fn match_highlight() -> Style {
        Style::default()
            .fg(Self::BG)
            .bg(Self::HIGHLIGHT)
            .add_modifier(Modifier::BOLD)
    }

    pub fn status_bar() -> Style {
        Style::default().fg(Self::FG_DIM).bg(Color::DarkGray)
    }

    pub fn status_bar_key() -> Style {
        Style::default()
            .fg(Self::HIGHLIGHT)
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD)
    }

    pub fn banner_ok() -> Style {
        Style::default().fg(Self::SUCCESS)
    }

    pub fn banner_pending() -> Style {
        Style::default().fg(Self::WARNING)
    }

    pub fn error() -> Style {
        Style::default()
            .fg(Self::ERROR)
            .add_modifier(Modifier::BOLD)
    }
}
