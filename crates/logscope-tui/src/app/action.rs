/// All viewer actions (command pattern)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Quit,

    // Log navigation
    ScrollUp(usize),
    ScrollDown(usize),
    PageUp,
    PageDown,
    ScrollToTop,
    ScrollToBottom,
    ToggleFollow,

    // Display toggles
    ToggleTimestamps,
    ToggleLocalTime,
    ToggleStats,
    ToggleWrap,

    // Search/Filter
    OpenSearch,
    CloseSearch,
    SearchInput(char),
    SearchBackspace,
    SearchClear,
    ApplyFilter,
    ClearFilter,
    ToggleCaseSensitive,
    CycleLevelFilter,

    // Stream control
    NextContainer,
    PrevContainer,
    ClearLogs,
    ExportLogs,
    Reconnect,

    DismissMessage,
}
