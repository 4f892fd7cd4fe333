//! Encoder configuration
//!
//! Resolved once at startup and shared read-only with the supervisor. Every
//! spawn, including crash restarts, derives the same argument list from it.

use std::time::Duration;

/// Parameters of the upstream screen encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Encoder binary
    pub program: String,

    /// Capture source (X11 display, e.g. ":99")
    pub display: String,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Capture and output frame rate
    pub framerate: u32,

    /// Target bitrate (ffmpeg syntax, e.g. "1500k")
    pub bitrate: String,

    /// Maximum bitrate
    pub maxrate: String,

    /// Rate-control buffer size
    pub bufsize: String,

    /// Video codec
    pub codec: String,

    /// libvpx deadline ("realtime", "good", "best")
    pub deadline: String,

    /// libvpx speed/quality trade-off
    pub cpu_used: i32,

    /// Encoder thread count
    pub threads: u32,

    /// ffmpeg `-loglevel`
    pub loglevel: String,

    /// Delay before restarting a crashed encoder
    pub restart_delay: Duration,

    /// Grace period after SIGTERM before force-kill (zero = never force)
    pub kill_timeout: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            display: ":99".to_string(),
            width: 1920,
            height: 1080,
            framerate: 25,
            bitrate: "1500k".to_string(),
            maxrate: "1500k".to_string(),
            bufsize: "3000k".to_string(),
            codec: "libvpx".to_string(),
            deadline: "realtime".to_string(),
            cpu_used: 8,
            threads: 4,
            loglevel: "error".to_string(),
            restart_delay: Duration::from_millis(1000),
            kill_timeout: Duration::from_secs(5),
        }
    }
}

impl EncoderConfig {
    /// Set the encoder binary
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Set the capture display
    pub fn display(mut self, display: impl Into<String>) -> Self {
        self.display = display.into();
        self
    }

    /// Set the frame size
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the frame rate
    pub fn framerate(mut self, fps: u32) -> Self {
        self.framerate = fps;
        self
    }

    /// Set the target bitrate
    pub fn bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.bitrate = bitrate.into();
        self
    }

    /// Set the crash restart delay
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Set the force-kill grace period
    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// `WxH` string used for `-video_size`
    pub fn video_size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Command-line arguments for the encoder
    ///
    /// Output is a WebM container written to stdout.
    pub fn args(&self) -> Vec<String> {
        let input = [
            ("-loglevel", self.loglevel.clone()),
            ("-f", "x11grab".to_string()),
            ("-video_size", self.video_size()),
            ("-framerate", self.framerate.to_string()),
            ("-i", self.display.clone()),
        ];
        let output = [
            ("-c:v", self.codec.clone()),
            ("-b:v", self.bitrate.clone()),
            ("-maxrate", self.maxrate.clone()),
            ("-bufsize", self.bufsize.clone()),
            ("-deadline", self.deadline.clone()),
            ("-cpu-used", self.cpu_used.to_string()),
            ("-threads", self.threads.to_string()),
            ("-f", "webm".to_string()),
        ];

        let mut args = Vec::with_capacity(2 * (input.len() + output.len()) + 2);
        push_options(&mut args, input);
        args.push("-an".to_string());
        push_options(&mut args, output);
        args.push("-".to_string());
        args
    }
}

fn push_options<const N: usize>(args: &mut Vec<String>, options: [(&str, String); N]) {
    for (flag, value) in options {
        args.push(flag.to_string());
        args.push(value);
    }
}
