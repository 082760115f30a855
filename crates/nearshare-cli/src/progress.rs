//! Transfer progress display with progress bars.

use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar for one inbound transfer
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a new progress tracker
    #[must_use]
    pub fn new(total_bytes: u64, filename: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);

        bar.set_style(
            ProgressStyle::with_template(
                "{msg:20!} [{bar:36.green/white}] {bytes}/{total_bytes} {bytes_per_sec:>12} eta {eta:>4}",
            )
            .expect("progress template is valid")
            .progress_chars("=> "),
        );

        bar.set_message(filename.to_string());

        Self { bar }
    }

    /// Update progress
    pub fn update(&self, received_bytes: u64) {
        self.bar.set_position(received_bytes);
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Format a byte count for display (KB = 1024, 2-decimal rounding)
///
/// # Example
///
/// ```
/// use nearshare_cli::progress::format_file_size;
///
/// assert_eq!(format_file_size(1024), "1.00 KB");
/// assert_eq!(format_file_size(1024 * 1024), "1.00 MB");
/// ```
#[must_use]
pub fn format_file_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let size = bytes as f64;
    if size >= GB {
        format!("{:.2} GB", size / GB)
    } else if size >= MB {
        format!("{:.2} MB", size / MB)
    } else if size >= KB {
        format!("{:.2} KB", size / KB)
    } else {
        format!("{size:.2} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0.00 B");
        assert_eq!(format_file_size(512), "512.00 B");
        assert_eq!(format_file_size(1023), "1023.00 B");
        assert_eq!(format_file_size(1024), "1.00 KB");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(1_048_576), "1.00 MB");
        assert_eq!(format_file_size(2_621_440), "2.50 MB");
        assert_eq!(format_file_size(1_073_741_824), "1.00 GB");
    }

    #[test]
    fn test_format_file_size_rounds_to_two_decimals() {
        assert_eq!(format_file_size(250_000), "244.14 KB");
    }
}
