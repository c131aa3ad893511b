use std::sync::Arc;

use logscope_logs::{CompiledFilter, FilterPresets, OrderedLogStore};
use logscope_types::LogRecord;

use super::Action;

/// Side effects the event loop has to carry out for an action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    Quit,
    SwitchContainer(String),
    ClearLogs,
    ExportLogs,
    Reconnect,
}

/// Level preset applied on top of the text filter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LevelFilter {
    #[default]
    All,
    WarningsAndAbove,
    ErrorsOnly,
}

impl LevelFilter {
    pub fn next(self) -> Self {
        match self {
            Self::All => Self::WarningsAndAbove,
            Self::WarningsAndAbove => Self::ErrorsOnly,
            Self::ErrorsOnly => Self::All,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::WarningsAndAbove => "warn+",
            Self::ErrorsOnly => "errors",
        }
    }

    fn preset(self) -> Option<CompiledFilter> {
        match self {
            Self::All => None,
            Self::WarningsAndAbove => Some(FilterPresets::warnings_and_above()),
            Self::ErrorsOnly => Some(FilterPresets::errors_only()),
        }
    }
}

/// Filtered records for one (store revision, filter generation) pair
#[derive(Default)]
pub struct FilterCache {
    key: Option<(u64, u64)>,
    entries: Vec<Arc<LogRecord>>,
}

/// UI state for the log viewer
pub struct ViewState {
    /// Index of the first visible row
    pub scroll: usize,
    /// Stick to the newest record as the store grows
    pub follow: bool,
    /// Rows in the last rendered viewport
    pub page_size: usize,

    pub show_timestamps: bool,
    pub use_local_time: bool,
    pub stats_visible: bool,
    /// Wrap long lines instead of cutting them at the edge
    pub wrap: bool,

    // Search/Filter
    pub search_active: bool,
    pub search_input: String,
    pub active_filter: Option<CompiledFilter>,
    pub filter_error: Option<String>,
    pub case_insensitive: bool,
    pub level_filter: LevelFilter,
    level_preset: Option<CompiledFilter>,
    filter_generation: u64,
    filter_cache: FilterCache,

    /// One-line message shown in the status bar
    pub message: Option<String>,

    containers: Vec<String>,
    container_index: usize,
}

impl ViewState {
    pub fn new() -> Self {
        Self {
            scroll: 0,
            follow: true,
            page_size: 20,
            show_timestamps: true,
            use_local_time: false,
            stats_visible: false,
            wrap: false,
            search_active: false,
            search_input: String::new(),
            active_filter: None,
            filter_error: None,
            case_insensitive: true,
            level_filter: LevelFilter::All,
            level_preset: None,
            filter_generation: 0,
            filter_cache: FilterCache::default(),
            message: None,
            containers: Vec::new(),
            container_index: 0,
        }
    }

    /// Containers Tab cycles through, and the one being tailed
    pub fn set_containers(&mut self, containers: Vec<String>, current: &str) {
        self.container_index = containers.iter().position(|c| c == current).unwrap_or(0);
        self.containers = containers;
    }

    pub fn current_container(&self) -> Option<&str> {
        self.containers.get(self.container_index).map(String::as_str)
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn show_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    /// The applied filter as it was typed
    pub fn filter_text(&self) -> String {
        self.active_filter
            .as_ref()
            .map(filter_input)
            .unwrap_or_default()
    }

    /// Whether any text or level filter narrows the view
    pub fn is_filtering(&self) -> bool {
        self.active_filter.is_some() || self.level_preset.is_some()
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.active_filter.as_ref().is_none_or(|f| f.matches(record))
            && self.level_preset.as_ref().is_none_or(|f| f.matches(record))
    }

    /// Records passing the current filters, recomputed only when the store or
    /// the filters change
    pub fn filtered(&mut self, store: &OrderedLogStore) -> &[Arc<LogRecord>] {
        let key = (store.revision(), self.filter_generation);
        if self.filter_cache.key != Some(key) {
            let entries: Vec<Arc<LogRecord>> = store.filter(|r| self.matches(r)).collect();
            self.filter_cache = FilterCache {
                key: Some(key),
                entries,
            };
        }
        &self.filter_cache.entries
    }

    /// Clamp the scroll offset for `total` rows in a viewport of `height`
    pub fn clamp_scroll(&mut self, total: usize, height: usize) {
        self.page_size = height.max(1);
        let max_scroll = total.saturating_sub(height);
        if self.follow || self.scroll > max_scroll {
            self.scroll = max_scroll;
        }
    }

    /// Apply an action; returns what the event loop must do about it
    pub fn handle(&mut self, action: Action) -> Option<Effect> {
        match action {
            Action::Quit => return Some(Effect::Quit),

            Action::ScrollUp(n) => {
                self.follow = false;
                self.scroll = self.scroll.saturating_sub(n);
            }
            Action::ScrollDown(n) => {
                self.scroll = self.scroll.saturating_add(n);
            }
            Action::PageUp => {
                self.follow = false;
                self.scroll = self.scroll.saturating_sub(self.page_size);
            }
            Action::PageDown => {
                self.scroll = self.scroll.saturating_add(self.page_size);
            }
            Action::ScrollToTop => {
                self.follow = false;
                self.scroll = 0;
            }
            Action::ScrollToBottom => self.follow = true,
            Action::ToggleFollow => self.follow = !self.follow,

            Action::ToggleTimestamps => self.show_timestamps = !self.show_timestamps,
            Action::ToggleLocalTime => self.use_local_time = !self.use_local_time,
            Action::ToggleStats => self.stats_visible = !self.stats_visible,
            Action::ToggleWrap => self.wrap = !self.wrap,

            Action::OpenSearch => {
                self.search_active = true;
                self.search_input = self.filter_text();
            }
            Action::CloseSearch => {
                self.search_active = false;
                self.filter_error = None;
            }
            Action::SearchInput(c) => self.search_input.push(c),
            Action::SearchBackspace => {
                self.search_input.pop();
            }
            Action::SearchClear => self.search_input.clear(),
            Action::ApplyFilter => self.apply_filter(),
            Action::ClearFilter => {
                self.active_filter = None;
                self.filter_error = None;
                self.search_input.clear();
                self.filters_changed();
            }
            Action::ToggleCaseSensitive => {
                self.case_insensitive = !self.case_insensitive;
                if let Some(input) = self.active_filter.as_ref().map(filter_input) {
                    self.search_input = input;
                    self.apply_filter();
                }
            }
            Action::CycleLevelFilter => {
                self.level_filter = self.level_filter.next();
                self.level_preset = self.level_filter.preset();
                self.filters_changed();
            }

            Action::NextContainer | Action::PrevContainer => {
                let count = self.containers.len();
                if count < 2 {
                    return None;
                }
                self.container_index = if action == Action::NextContainer {
                    (self.container_index + 1) % count
                } else {
                    (self.container_index + count - 1) % count
                };
                self.scroll = 0;
                self.follow = true;
                return self
                    .current_container()
                    .map(|c| Effect::SwitchContainer(c.to_string()));
            }
            Action::ClearLogs => {
                self.scroll = 0;
                self.follow = true;
                return Some(Effect::ClearLogs);
            }
            Action::ExportLogs => return Some(Effect::ExportLogs),
            Action::Reconnect => return Some(Effect::Reconnect),

            Action::DismissMessage => self.message = None,
        }
        None
    }

    /// Compile the filter input. A leading `!` keeps the lines that do not match.
    fn apply_filter(&mut self) {
        let (invert, pattern) = match self.search_input.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, self.search_input.as_str()),
        };
        if pattern.is_empty() {
            self.active_filter = None;
            self.filter_error = None;
            self.search_active = false;
            self.filters_changed();
            return;
        }

        let compiled = if self.case_insensitive {
            CompiledFilter::new_case_insensitive(pattern)
        } else {
            CompiledFilter::new(pattern)
        };
        match compiled {
            Ok(filter) => {
                self.active_filter = Some(if invert { filter.inverted() } else { filter });
                self.filter_error = None;
                self.search_active = false;
                self.follow = true;
                self.filters_changed();
            }
            Err(e) => {
                // Keep the input open so the pattern can be fixed
                self.filter_error = Some(e.to_string());
            }
        }
    }

    fn filters_changed(&mut self) {
        self.filter_generation += 1;
    }
}

/// Input text that recreates `filter`
fn filter_input(filter: &CompiledFilter) -> String {
    if filter.is_inverted() {
        format!("!{}", filter.pattern())
    } else {
        filter.pattern().to_string()
    }
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new()
    }
}
