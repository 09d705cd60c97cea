use std::time::Duration;

/// Engine tuning parameters shared by router, pipelines and presenter.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Fixed PCM output rate. `None` lets the audio output pick (falling back to the source rate).
    pub output_sample_rate: Option<u32>,
    /// Resampler chunk size in frames.
    pub resample_chunk_frames: usize,
    /// In-flight packets per pipeline before the router blocks.
    pub packet_queue_depth: usize,
    /// Upper bound on how long any interruptible wait sleeps before rechecking.
    pub poll_interval: Duration,
    /// Audio clock value below which video is shown without pacing.
    pub clock_warmup_ms: f64,
    /// Longest single presentation delay honored for one frame.
    pub max_present_delay_ms: u64,
    /// Decoded units this far before a seek target are still shown.
    pub seek_tolerance_ms: f64,
    /// Try hardware decoding before software.
    pub hwaccel: bool,
    /// CUDA decode is skipped for streams wider than this.
    pub cuda_max_width: u32,
    /// Buffer capacity of the built-in audio outputs.
    pub sink_buffer_ms: u32,
}

impl Default for EngineConfig {
    /// Defaults match a depth-1 submit-and-wait router with short interrupt latency.
    fn default() -> Self {
        Self {
            output_sample_rate: None,
            resample_chunk_frames: 1024,
            packet_queue_depth: 1,
            poll_interval: Duration::from_millis(20),
            clock_warmup_ms: 0.1,
            max_present_delay_ms: 1000,
            seek_tolerance_ms: 40.0,
            hwaccel: true,
            cuda_max_width: 2032,
            sink_buffer_ms: 200,
        }
    }
}
