use colored::Colorize;
use declarative::{ApplyResult, ProbeState};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Result Symbols
// ============================================================================

/// Symbol for an operation outcome
pub fn result_symbol(result: &ApplyResult) -> String {
    match result {
        ApplyResult::Unchanged => "=".dimmed().to_string(),
        ApplyResult::Changed => "✓".green().to_string(),
        ApplyResult::Failed { .. } => "✗".red().to_string(),
        ApplyResult::Skipped { .. } => "-".yellow().to_string(),
    }
}

/// Symbol for a planned change
pub fn state_symbol(state: &ProbeState) -> String {
    match state {
        ProbeState::Matches => "=".dimmed().to_string(),
        ProbeState::Differs { .. } => "~".yellow().to_string(),
        ProbeState::Absent => "+".green().to_string(),
    }
}

/// Single-line preview of a probe detail
pub fn preview(text: &str, max_len: usize) -> String {
    let first = text.lines().next().unwrap_or_default();
    let count = first.chars().count();
    let mut out: String = first.chars().take(max_len).collect();
    if count > max_len || text.lines().nth(1).is_some() {
        out.push('…');
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short() {
        assert_eq!(preview("enabled, running", 40), "enabled, running");
        assert_eq!(preview("", 10), "");
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("abcdefgh", 4), "abcd…");
        assert_eq!(preview("line one\nline two", 40), "line one…");
    }

    #[test]
    fn test_symbols_are_distinct() {
        colored::control::set_override(false);
        assert_eq!(result_symbol(&ApplyResult::Changed), "✓");
        assert_eq!(result_symbol(&ApplyResult::Unchanged), "=");
        assert_eq!(state_symbol(&ProbeState::Absent), "+");
        assert_eq!(state_symbol(&ProbeState::differs("a", "b")), "~");
    }
}
