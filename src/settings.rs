use std::time::Duration;

/// Tunables of an engine, built with [`SettingsBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub operation_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: u8,
    pub retry_interval: Duration,
    pub retry_backoff: f64,
    pub max_iovecs: usize,
    pub read_chunk: usize,
    /// Frames declaring a larger size are skipped and counted as protocol errors.
    pub max_frame_size: usize,
    pub max_protocol_errors: usize,
}

impl Default for Settings {
    fn default() -> Settings {
        SettingsBuilder::default().build()
    }
}

pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> SettingsBuilder {
        SettingsBuilder {
            settings: Settings {
                operation_timeout: Duration::from_millis(2500),
                connect_timeout: Duration::from_secs(2),
                max_redirects: 8,
                retry_interval: Duration::from_millis(10),
                retry_backoff: 1.5,
                max_iovecs: 32,
                read_chunk: mcpipe_protocol::DEFAULT_BUF_SIZE,
                max_frame_size: mcpipe_protocol::DEFAULT_MAX_FRAME,
                max_protocol_errors: 3,
            },
        }
    }
}

impl SettingsBuilder {
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.settings.operation_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connect_timeout = timeout;
        self
    }

    pub fn max_redirects(mut self, redirects: u8) -> Self {
        self.settings.max_redirects = redirects;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.settings.retry_interval = interval;
        self
    }

    pub fn retry_backoff(mut self, backoff: f64) -> Self {
        self.settings.retry_backoff = backoff;
        self
    }

    pub fn max_iovecs(mut self, max: usize) -> Self {
        self.settings.max_iovecs = std::cmp::max(max, 1);
        self
    }

    pub fn read_chunk(mut self, chunk: usize) -> Self {
        self.settings.read_chunk = std::cmp::max(chunk, 1);
        self
    }

    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.settings.max_frame_size = std::cmp::max(max, mcpipe_protocol::HEADER_SIZE);
        self
    }

    pub fn max_protocol_errors(mut self, max: usize) -> Self {
        self.settings.max_protocol_errors = std::cmp::max(max, 1);
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides() {
        let settings = SettingsBuilder::default()
            .max_redirects(2)
            .max_iovecs(0)
            .retry_interval(Duration::from_millis(1))
            .build();
        assert_eq!(settings.max_redirects, 2);
        assert_eq!(settings.max_iovecs, 1);
        assert_eq!(settings.retry_interval, Duration::from_millis(1));
        assert_eq!(settings.read_chunk, 8 * 1024);
        assert_eq!(settings.max_frame_size, mcpipe_protocol::DEFAULT_MAX_FRAME);
        assert_eq!(SettingsBuilder::default().max_frame_size(1).build().max_frame_size, 24);
        assert_eq!(Settings::default().max_iovecs, 32);
    }
}
