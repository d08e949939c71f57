//! Terminal widget seam.
//!
//! A widget renders one tab's terminal. Its lifetime belongs to the tab, not
//! to the place it is shown: moving a tab between layout slots calls
//! [`TerminalWidget::attach`] instead of recreating the widget, so the
//! buffer and the channel survive layout changes.

use std::collections::VecDeque;

use protocol::Geometry;

/// Pixel size of the container a widget is fitted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerSize {
    pub width: u32,
    pub height: u32,
}

impl ContainerSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Where a widget is currently mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutSlot {
    /// Not mounted anywhere; the widget keeps its buffer.
    #[default]
    Detached,
    /// The docked terminal panel.
    Panel,
    /// The maximized terminal view.
    Maximized,
}

/// A terminal renderer bound to one tab.
pub trait TerminalWidget: Send {
    /// Feeds terminal output to the widget.
    fn write(&mut self, data: &str);

    /// Recomputes the character grid for a container size.
    fn fit(&mut self, container: ContainerSize) -> Geometry;

    /// Returns the current character grid.
    fn geometry(&self) -> Geometry;

    /// Moves the widget to another layout slot without recreating it.
    fn attach(&mut self, slot: LayoutSlot);

    /// Returns the slot the widget is mounted in.
    fn slot(&self) -> LayoutSlot;

    /// Clears the buffer.
    fn clear(&mut self);

    /// Returns the buffered text.
    fn contents(&self) -> String;
}

/// Builds a fresh widget for a new tab.
pub type WidgetFactory = Box<dyn Fn() -> Box<dyn TerminalWidget> + Send + Sync>;

/// Default cell size used to turn pixels into a character grid.
pub const DEFAULT_CELL_WIDTH: u32 = 9;
pub const DEFAULT_CELL_HEIGHT: u32 = 18;

/// Headless widget keeping a bounded line scrollback.
///
/// Carriage returns are dropped and lines are split on `\n`; escape
/// sequences are stored as-is.
#[derive(Debug, Clone)]
pub struct ScrollbackWidget {
    lines: VecDeque<String>,
    partial: String,
    max_lines: usize,
    geometry: Geometry,
    slot: LayoutSlot,
    cell_width: u32,
    cell_height: u32,
}

impl ScrollbackWidget {
    /// Creates a widget keeping at most `max_lines` complete lines.
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: String::new(),
            max_lines: max_lines.max(1),
            geometry: Geometry::default(),
            slot: LayoutSlot::Detached,
            cell_width: DEFAULT_CELL_WIDTH,
            cell_height: DEFAULT_CELL_HEIGHT,
        }
    }

    /// Sets the cell size used by [`TerminalWidget::fit`].
    pub fn with_cell_size(mut self, width: u32, height: u32) -> Self {
        self.cell_width = width.max(1);
        self.cell_height = height.max(1);
        self
    }

    /// Returns a factory building widgets with `max_lines` of scrollback.
    pub fn factory(max_lines: usize) -> WidgetFactory {
        Box::new(move || -> Box<dyn TerminalWidget> { Box::new(ScrollbackWidget::new(max_lines)) })
    }

    /// Returns the number of complete lines held.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

impl TerminalWidget for ScrollbackWidget {
    fn write(&mut self, data: &str) {
        for ch in data.chars() {
            match ch {
                '\r' => {}
                '\n' => {
                    let line = std::mem::take(&mut self.partial);
                    self.lines.push_back(line);
                    if self.lines.len() > self.max_lines {
                        self.lines.pop_front();
                    }
                }
                _ => self.partial.push(ch),
            }
        }
    }

    fn fit(&mut self, container: ContainerSize) -> Geometry {
        let cols = (container.width / self.cell_width).clamp(1, u16::MAX as u32) as u16;
        let rows = (container.height / self.cell_height).clamp(1, u16::MAX as u32) as u16;
        self.geometry = Geometry { cols, rows };
        self.geometry
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn attach(&mut self, slot: LayoutSlot) {
        self.slot = slot;
    }

    fn slot(&self) -> LayoutSlot {
        self.slot
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }

    /// Includes the unterminated last line.
    fn contents(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&self.partial);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_splits_lines_and_drops_cr() {
        let mut widget = ScrollbackWidget::new(100);
        widget.write("one\r\ntwo\r\nthr");
        widget.write("ee");
        assert_eq!(widget.line_count(), 2);
        assert_eq!(widget.contents(), "one\ntwo\nthree");
    }

    #[test]
    fn test_scrollback_is_bounded() {
        let mut widget = ScrollbackWidget::new(2);
        widget.write("a\nb\nc\n");
        assert_eq!(widget.contents(), "b\nc\n");
    }

    #[test]
    fn test_fit_uses_cell_size() {
        let mut widget = ScrollbackWidget::new(10).with_cell_size(10, 20);
        let geometry = widget.fit(ContainerSize::new(800, 480));
        assert_eq!(geometry, Geometry { cols: 80, rows: 24 });
        assert_eq!(widget.geometry(), geometry);

        // Never collapses to zero.
        let tiny = widget.fit(ContainerSize::new(3, 3));
        assert_eq!(tiny, Geometry { cols: 1, rows: 1 });
    }

    #[test]
    fn test_factory_builds_fresh_widgets() {
        let factory = ScrollbackWidget::factory(10);
        let mut first = factory();
        first.write("only here\n");
        assert_eq!(factory().contents(), "");
        assert_eq!(first.geometry(), Geometry::default());
    }

    #[test]
    fn test_attach_keeps_buffer() {
        let mut widget = ScrollbackWidget::new(10);
        widget.write("keep me\n");
        widget.attach(LayoutSlot::Maximized);
        widget.attach(LayoutSlot::Panel);
        assert_eq!(widget.slot(), LayoutSlot::Panel);
        assert_eq!(widget.contents(), "keep me\n");

        widget.clear();
        assert_eq!(widget.contents(), "");
    }
}
