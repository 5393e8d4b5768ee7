use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar for a download of `total` bytes, or a byte-counting spinner
/// when the server sends no content length.
pub fn create_download_bar(total: Option<u64>, message: String) -> ProgressBar {
    let pb = match total {
        Some(len) => {
            let pb = ProgressBar::new(len);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
            {
                pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
            }
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::default_spinner().template("{spinner} {bytes} {msg}")
            {
                pb.set_style(style);
            }
            pb
        }
    };
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
