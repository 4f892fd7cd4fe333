//! Encoder stderr monitor
//!
//! ffmpeg writes diagnostics and progress to stderr. Progress lines are
//! summarised at most every few seconds; anything else is surfaced as a
//! warning, since the encoder runs with `-loglevel error`.

use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Minimum spacing between progress summaries
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub struct FfmpegMonitor;

impl FfmpegMonitor {
    /// Spawn a task that logs `stderr` until it closes
    pub fn start<R>(stderr: R, target_bitrate: Option<String>, label: String)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last_log_time: Option<Instant> = None;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(encoder = %label, error = %e, "Encoder stderr closed");
                        break;
                    }
                };

                // ffmpeg separates progress updates with '\r'
                for line in line.split('\r').map(str::trim).filter(|l| !l.is_empty()) {
                    if !is_progress(line) {
                        tracing::warn!(encoder = %label, "ffmpeg: {}", line);
                        continue;
                    }

                    let due = last_log_time
                        .map(|t| t.elapsed() >= PROGRESS_LOG_INTERVAL)
                        .unwrap_or(true);
                    if due {
                        log_progress(&label, line, target_bitrate.as_deref());
                        last_log_time = Some(Instant::now());
                    }
                }
            }
        });
    }
}

/// Video and audio progress lines both carry `time=` and `bitrate=`
fn is_progress(line: &str) -> bool {
    line.contains("time=") && line.contains("bitrate=")
}

fn log_progress(label: &str, line: &str, target_bitrate: Option<&str>) {
    let frame = extract_value(line, "frame=");
    let fps = extract_value(line, "fps=");

    // Warmup lines
    if frame.as_deref() == Some("0") || fps.as_deref() == Some("0.0") {
        return;
    }

    let mut bitrate = extract_value(line, "bitrate=");
    if bitrate.as_deref() == Some("N/A") || bitrate.is_none() {
        bitrate = target_bitrate.map(|t| format!("{} (target)", t));
    }

    let time = extract_value(line, "time=");
    let speed = extract_value(line, "speed=");
    let drop = extract_value(line, "drop=");

    tracing::info!(
        encoder = %label,
        time = time.as_deref().unwrap_or("??"),
        bitrate = bitrate.as_deref().unwrap_or("N/A"),
        speed = speed.as_deref().unwrap_or("??"),
        fps = fps.as_deref().unwrap_or("??"),
        drop = drop.as_deref().unwrap_or("0"),
        "Encoder progress"
    );
}

fn extract_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)?;
    let after_key = &line[start + key.len()..];
    // Values may be padded, e.g. "frame=  123"
    let value_start = after_key
        .find(|c: char| !c.is_whitespace())
        .unwrap_or(0);
    let value_part = &after_key[value_start..];

    let end = value_part
        .find(char::is_whitespace)
        .unwrap_or(value_part.len());
    Some(value_part[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_value() {
        let line = "frame= 123 fps= 25.0 q=0.0 size= 1024kB time=00:00:10.00 bitrate= 1500.0kbits/s speed= 1.0x";

        assert_eq!(extract_value(line, "frame="), Some("123".to_string()));
        assert_eq!(extract_value(line, "fps="), Some("25.0".to_string()));
        assert_eq!(extract_value(line, "time="), Some("00:00:10.00".to_string()));
        assert_eq!(
            extract_value(line, "bitrate="),
            Some("1500.0kbits/s".to_string())
        );
        assert_eq!(extract_value(line, "speed="), Some("1.0x".to_string()));
        assert_eq!(extract_value(line, "missing="), None);
    }

    #[test]
    fn test_is_progress() {
        assert!(is_progress(
            "frame= 123 fps= 25.0 size= 1024kB time=00:00:10.00 bitrate= 1500.0kbits/s speed= 1.0x"
        ));
        assert!(!is_progress("[x11grab @ 0x5580] Cannot open display :99, error 1."));
    }

    #[tokio::test]
    async fn test_monitor_drains_until_eof() {
        let stderr: &'static [u8] =
            b"[x11grab @ 0x1] warming up\nframe= 10 fps= 25.0 time=00:00:00.40 bitrate= 900kbits/s speed= 1x\r";

        // Runs to completion without panicking on mixed line endings
        FfmpegMonitor::start(stderr, Some("1500k".to_string()), "encoder-1".to_string());
        tokio::task::yield_now().await;
    }
}
