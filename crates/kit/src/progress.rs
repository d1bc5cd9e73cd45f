//! Console progress indication for long waits.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Create a spinner for a wait of unknown duration (boot, discovery).
pub fn wait_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
            .expect("static progress template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}
