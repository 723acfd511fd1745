use std::collections::VecDeque;
use std::sync::Mutex;

const DEFAULT_MAX_LINES: usize = 200;

/// Bounded ring of stdout/stderr lines captured from one plugin process.
pub struct OutputBuffer {
    max_lines: usize,
    lines: Mutex<VecDeque<String>>,
}

impl OutputBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a line, evicting the oldest once over capacity.
    pub fn push(&self, line: String) {
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.push_back(line);
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        let start = lines.len().saturating_sub(n);
        lines.iter().skip(start).cloned().collect()
    }

    /// Everything retained, newline separated.
    pub fn contents(&self) -> String {
        self.tail(self.max_lines).join("\n")
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
