use advisor_store::StoreConfig;

#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub store: StoreConfig,
    /// Capacity of the channel a client-side watch stream delivers into.
    pub client_buffer: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self { store: StoreConfig::default(), client_buffer: 256 }
    }
}

impl ViewConfig {
    /// Store settings from the environment plus `ADVISOR_CLIENT_BUFFER`.
    pub fn from_env() -> Self {
        let client_buffer = std::env::var("ADVISOR_CLIENT_BUFFER")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(256);
        Self { store: StoreConfig::from_env(), client_buffer }
    }
}
