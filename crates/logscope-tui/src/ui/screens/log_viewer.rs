use std::sync::Arc;

use chrono::Local;
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Margin, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState},
};
use unicode_width::UnicodeWidthChar;

use logscope_logs::{OrderedLogStore, ViewStatus, strip_ansi};
use logscope_types::{LogRecord, SubscriptionKey};

use crate::app::ViewState;
use crate::ui::Theme;
use crate::ui::components::{StatusBar, log_viewer_hints};

/// What the header shows about the current subscription
pub struct ViewHeader<'a> {
    pub key: Option<&'a SubscriptionKey>,
    pub status: &'a ViewStatus,
    /// Containers in the pod, for the Tab hint
    pub container_count: usize,
}

/// Log viewer screen
pub struct LogViewerScreen;

impl LogViewerScreen {
    pub fn render(
        frame: &mut Frame,
        state: &mut ViewState,
        store: &OrderedLogStore,
        header: &ViewHeader<'_>,
    ) {
        let show_filter_bar = state.search_active
            || state.active_filter.is_some()
            || state.filter_error.is_some()
            || state.is_filtering();

        let mut constraints = vec![Constraint::Length(3)];
        if state.stats_visible {
            constraints.push(Constraint::Length(3));
        }
        if show_filter_bar {
            constraints.push(Constraint::Length(3));
        }
        constraints.push(Constraint::Min(1));
        constraints.push(Constraint::Length(1));

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(frame.area());

        let mut idx = 0;
        Self::render_header(frame, chunks[idx], header);
        idx += 1;

        if state.stats_visible {
            Self::render_stats_bar(frame, chunks[idx], store);
            idx += 1;
        }
        if show_filter_bar {
            Self::render_filter_bar(frame, chunks[idx], state);
            idx += 1;
        }

        let total = Self::render_logs(frame, chunks[idx], state, store, header.status);
        idx += 1;

        Self::render_status_bar(frame, chunks[idx], state, total, header.container_count);
    }

    fn render_header(frame: &mut Frame, area: Rect, header: &ViewHeader<'_>) {
        let mut spans = vec![Span::styled("logscope", Theme::title())];

        if let Some(key) = header.key {
            for (part, style) in [
                (key.cluster.as_str(), Theme::text()),
                (key.namespace.as_str(), Theme::text()),
                (key.pod.as_str(), Theme::text_highlight()),
                (key.container.as_str(), Theme::text()),
            ] {
                spans.push(Span::styled(" │ ", Theme::text_dim()));
                spans.push(Span::styled(part.to_string(), style));
            }
        }

        spans.push(Span::styled(" │ ", Theme::text_dim()));
        spans.push(status_banner(header.status));

        let widget = Paragraph::new(Line::from(spans)).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(if header.status.is_failure() {
                    Theme::error()
                } else {
                    Theme::border()
                }),
        );
        frame.render_widget(widget, area);
    }

    fn render_filter_bar(frame: &mut Frame, area: Rect, state: &ViewState) {
        let mut spans = Vec::new();

        if state.search_active {
            spans.push(Span::styled(" /", Theme::text_highlight()));
        } else {
            spans.push(Span::styled(" Filter: ", Theme::text_dim()));
        }

        let pattern = if state.search_active {
            state.search_input.clone()
        } else {
            state.filter_text()
        };
        spans.push(Span::styled(pattern, Theme::text_highlight()));

        if state.search_active {
            spans.push(Span::styled(
                "█",
                Style::default()
                    .fg(Theme::HIGHLIGHT)
                    .add_modifier(Modifier::SLOW_BLINK),
            ));
        }

        if let Some(err) = &state.filter_error {
            spans.push(Span::styled(format!("  ⚠ {}", err), Theme::error()));
        }

        spans.push(Span::styled(
            format!(
                "  [{}] level:{}",
                if state.case_insensitive { "i" } else { "I" },
                state.level_filter.label()
            ),
            Theme::text_dim(),
        ));

        if state.search_active {
            spans.push(Span::styled("  [Enter] Apply  [Esc] Cancel", Theme::text_dim()));
        } else {
            spans.push(Span::styled("  [n] Clear  [/] Edit", Theme::text_dim()));
        }

        let widget = Paragraph::new(Line::from(spans)).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(if state.filter_error.is_some() {
                    Theme::error()
                } else if state.search_active {
                    Theme::text_highlight()
                } else {
                    Theme::border()
                })
                .title(Span::styled(" Search/Filter ", Theme::title())),
        );
        frame.render_widget(widget, area);
    }

    fn render_stats_bar(frame: &mut Frame, area: Rect, store: &OrderedLogStore) {
        let counts = store.level_counts();
        let mut spans = vec![Span::raw(" ")];

        for (label, count, color) in [
            ("FTL", counts.fatal, Theme::LOG_FATAL),
            ("ERR", counts.error, Theme::LOG_ERROR),
            ("WRN", counts.warn, Theme::LOG_WARN),
            ("INF", counts.info, Theme::LOG_INFO),
            ("DBG", counts.debug, Theme::LOG_DEBUG),
            ("TRC", counts.trace, Theme::LOG_TRACE),
        ] {
            spans.push(Span::styled(
                format!("{}:", label),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ));
            spans.push(Span::styled(format!("{} ", count), Theme::text()));
        }
        spans.push(Span::styled("│ Total:", Theme::text_dim()));
        spans.push(Span::styled(counts.total().to_string(), Theme::text()));

        let widget = Paragraph::new(Line::from(spans)).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Theme::border())
                .title(Span::styled(" Stats ", Theme::title())),
        );
        frame.render_widget(widget, area);
    }

    /// Draw the visible window; returns the number of rows after filtering
    fn render_logs(
        frame: &mut Frame,
        area: Rect,
        state: &mut ViewState,
        store: &OrderedLogStore,
        status: &ViewStatus,
    ) -> usize {
        let inner_height = area.height.saturating_sub(2) as usize;

        let (total, visible): (usize, Vec<Arc<LogRecord>>) = if state.is_filtering() {
            let total = state.filtered(store).len();
            state.clamp_scroll(total, inner_height);
            let scroll = state.scroll;
            let visible = state
                .filtered(store)
                .iter()
                .skip(scroll)
                .take(inner_height)
                .cloned()
                .collect();
            (total, visible)
        } else {
            let total = store.len();
            state.clamp_scroll(total, inner_height);
            (total, store.range(state.scroll, inner_height))
        };

        let title = if state.is_filtering() {
            format!(" Logs ({} matching) ", total)
        } else {
            format!(" Logs ({}) ", total)
        };
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Theme::border())
            .title(Span::styled(title, Theme::title()));

        if total == 0 {
            let placeholder = Paragraph::new(Line::from(Span::styled(
                empty_message(status, state.is_filtering()),
                Theme::text_dim(),
            )))
            .block(block);
            frame.render_widget(placeholder, area);
            return 0;
        }

        // Borders and scrollbar
        let inner_width = area.width.saturating_sub(4) as usize;
        let mut lines: Vec<Line> = visible
            .iter()
            .flat_map(|record| format_record(record, state, inner_width))
            .collect();
        // Wrapped rows can overflow; keep the newest in view while following
        if lines.len() > inner_height {
            if state.follow {
                lines.drain(..lines.len() - inner_height);
            } else {
                lines.truncate(inner_height);
            }
        }
        frame.render_widget(Paragraph::new(lines).block(block), area);

        if total > inner_height {
            let max_scroll = total.saturating_sub(inner_height);
            let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
                .begin_symbol(Some("▲"))
                .end_symbol(Some("▼"));
            let mut scrollbar_state = ScrollbarState::default()
                .content_length(max_scroll)
                .position(state.scroll.min(max_scroll));
            frame.render_stateful_widget(
                scrollbar,
                area.inner(Margin {
                    vertical: 1,
                    horizontal: 0,
                }),
                &mut scrollbar_state,
            );
        }
        total
    }

    fn render_status_bar(
        frame: &mut Frame,
        area: Rect,
        state: &ViewState,
        total: usize,
        container_count: usize,
    ) {
        let hints: Vec<_> = log_viewer_hints()
            .into_iter()
            .filter(|(key, _)| *key != "Tab" || container_count > 1)
            .collect();

        let right = match &state.message {
            Some(message) => message.clone(),
            None => format!(
                "{} lines{}",
                total,
                if state.follow { " · follow" } else { "" }
            ),
        };
        frame.render_widget(StatusBar::new().hints(hints).right(right), area);
    }
}

/// Short banner for the current stream status
pub(crate) fn status_banner(status: &ViewStatus) -> Span<'static> {
    match status {
        ViewStatus::Idle => Span::styled("idle", Theme::text_dim()),
        ViewStatus::Connecting => Span::styled("connecting…", Theme::banner_pending()),
        ViewStatus::Waiting => Span::styled("● waiting for logs", Theme::banner_ok()),
        ViewStatus::Live => Span::styled("● live", Theme::banner_ok()),
        ViewStatus::Loaded => Span::styled("history", Theme::text()),
        ViewStatus::Reconnecting { attempt } => Span::styled(
            format!("reconnecting (attempt {})", attempt),
            Theme::banner_pending(),
        ),
        ViewStatus::StreamFailed(reason) => {
            Span::styled(format!("stream failed: {}", reason), Theme::error())
        }
        ViewStatus::HistoryFailed(reason) => {
            Span::styled(format!("history failed: {}", reason), Theme::error())
        }
    }
}

fn empty_message(status: &ViewStatus, filtering: bool) -> String {
    if filtering {
        return " No matching logs".to_string();
    }
    match status {
        ViewStatus::Connecting | ViewStatus::Reconnecting { .. } => " Connecting…".to_string(),
        ViewStatus::Waiting => " No logs yet".to_string(),
        ViewStatus::StreamFailed(reason) => format!(" Log stream failed: {}", reason),
        ViewStatus::HistoryFailed(reason) => format!(" Could not load history: {}", reason),
        _ => " No logs".to_string(),
    }
}

/// Display rows for one record: a single row cut at the edge, or several when
/// wrapping is on
fn format_record(record: &LogRecord, state: &ViewState, available_width: usize) -> Vec<Line<'static>> {
    if !state.wrap {
        return vec![format_line(record, state, available_width)];
    }

    let (prefix, prefix_width) = line_prefix(record, state);
    let text = strip_ansi(&record.text);
    let style = Theme::level_text(record.level);
    let matches = state
        .active_filter
        .as_ref()
        .map(|f| f.find_matches(&text))
        .unwrap_or_default();

    let mut lines = Vec::new();
    for (start, end) in wrap_ranges(&text, available_width.saturating_sub(prefix_width).max(1)) {
        let mut spans = if lines.is_empty() {
            prefix.clone()
        } else {
            vec![
                Span::raw(" ".repeat(prefix_width - 3)),
                Span::styled(" │ ", Theme::text_dim()),
            ]
        };
        // Matches relative to this row
        let row_matches: Vec<(usize, usize)> = matches
            .iter()
            .filter_map(|&(s, e)| {
                let (s, e) = (s.max(start), e.min(end));
                (s < e).then(|| (s - start, e - start))
            })
            .collect();
        spans.extend(highlight(&text[start..end], &row_matches, style));
        lines.push(Line::from(spans));
    }
    lines
}

fn format_line(record: &LogRecord, state: &ViewState, available_width: usize) -> Line<'static> {
    let (mut spans, prefix_width) = line_prefix(record, state);

    let text = strip_ansi(&record.text);
    let message = truncate_to_width(&text, available_width.saturating_sub(prefix_width));
    let style = Theme::level_text(record.level);

    let matches = state
        .active_filter
        .as_ref()
        .map(|f| f.find_matches(message))
        .unwrap_or_default();
    spans.extend(highlight(message, &matches, style));

    Line::from(spans)
}

/// Timestamp and level columns, with their display width
fn line_prefix(record: &LogRecord, state: &ViewState) -> (Vec<Span<'static>>, usize) {
    let mut spans = Vec::new();
    let mut width = 0;

    // " HH:MM:SS" = 9 columns
    if state.show_timestamps
        && let Some(ts) = record.logical_time
    {
        let time = if state.use_local_time {
            ts.with_timezone(&Local).format("%H:%M:%S").to_string()
        } else {
            ts.format("%H:%M:%S").to_string()
        };
        spans.push(Span::styled(format!(" {}", time), Theme::text_dim()));
        width += 9;
    }

    spans.push(Span::styled(
        format!(" {:>3}", record.level.as_str()),
        Style::default()
            .fg(Theme::level_color(record.level))
            .add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled(" │ ", Theme::text_dim()));
    width += 7;

    (spans, width)
}

/// Split `text` into plain and highlighted spans at the given byte ranges
fn highlight(text: &str, ranges: &[(usize, usize)], style: Style) -> Vec<Span<'static>> {
    let mut spans = Vec::new();
    let mut pos = 0;
    for &(start, end) in ranges {
        if start < pos || end <= start {
            continue;
        }
        if start > pos {
            spans.push(Span::styled(text[pos..start].to_string(), style));
        }
        spans.push(Span::styled(text[start..end].to_string(), Theme::match_highlight()));
        pos = end;
    }
    if pos < text.len() {
        spans.push(Span::styled(text[pos..].to_string(), style));
    }
    spans
}

/// Longest prefix of `text` that fits in `max_width` terminal columns
/// Byte ranges of `text` that each fit in `max_width` columns
fn wrap_ranges(text: &str, max_width: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut width = 0;
    for (idx, c) in text.char_indices() {
        let w = c.width().unwrap_or(0);
        if width + w > max_width && idx > start {
            ranges.push((start, idx));
            start = idx;
            width = 0;
        }
        width += w;
    }
    ranges.push((start, text.len()));
    ranges
}

fn truncate_to_width(text: &str, max_width: usize) -> &str {
    let mut width = 0;
    for (idx, c) in text.char_indices() {
        width += c.width().unwrap_or(0);
        if width > max_width {
            return &text[..idx];
        }
    }
    text
}
