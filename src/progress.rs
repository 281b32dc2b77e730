//! Progress bars for transfer and enrichment runs.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})";

/// Bar over `total` units of work. Hidden when `visible` is false (tests, non-tty runs).
pub fn create_progress_bar(total: u64, message: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::hidden());
    }
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Status line shown above the enrichment bar.
pub fn enrichment_message(saved: u64, errors: u64, requests: u64) -> String {
    format!("saved: {} | errors: {} | api requests: {}", saved, errors, requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_bar_still_counts() {
        let pb = create_progress_bar(10, "transfer", false);
        pb.inc(3);
        assert_eq!(pb.position(), 3);
        assert_eq!(pb.length(), Some(10));
        assert!(pb.is_hidden());
    }

    #[test]
    fn test_visible_bar_has_length() {
        let pb = create_progress_bar(250, "transfer", true);
        assert_eq!(pb.length(), Some(250));
        pb.finish_and_clear();
    }

    #[test]
    fn test_enrichment_message() {
        assert_eq!(enrichment_message(3, 1, 7), "saved: 3 | errors: 1 | api requests: 7");
    }
}
