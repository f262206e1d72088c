use log::warn;
use std::ffi::OsString;

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Carve slots from the in-binary placeholder before mapping memory.
    pub use_placeholder: bool,
    /// Cap on decoder-driven function length discovery.
    pub max_scan_len: usize,
    /// Promote overflowing displacements instead of failing.
    pub allow_widening: bool,
    /// Bytes reserved for a trampoline whose slot does not name a capacity.
    pub trampoline_capacity: usize,
    /// Size of each fresh executable mapping.
    pub mapping_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_placeholder: cfg!(target_os = "linux"),
            max_scan_len: 4096,
            allow_widening: true,
            trampoline_capacity: 256,
            mapping_size: 64 * 1024,
        }
    }
}

fn parse_usize(name: &str, raw: OsString) -> Option<usize> {
    match raw.to_str().and_then(|s| s.trim().parse::<usize>().ok()) {
        Some(v) if v > 0 => Some(v),
        _ => {
            warn!("ignoring invalid {name}={raw:?}");
            None
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `HOTSWAP_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    /// Defaults overlaid with whatever `get` returns for each `HOTSWAP_*` name.
    pub fn from_lookup(get: impl Fn(&str) -> Option<OsString>) -> Self {
        let mut config = Self::default();
        if get("HOTSWAP_NO_PLACEHOLDER").is_some() {
            config.use_placeholder = false;
        }
        if get("HOTSWAP_NO_WIDEN").is_some() {
            config.allow_widening = false;
        }
        if let Some(v) = get("HOTSWAP_MAX_SCAN").and_then(|raw| parse_usize("HOTSWAP_MAX_SCAN", raw)) {
            config.max_scan_len = v;
        }
        if let Some(v) = get("HOTSWAP_TRAMPOLINE_CAPACITY").and_then(|raw| parse_usize("HOTSWAP_TRAMPOLINE_CAPACITY", raw)) {
            config.trampoline_capacity = v;
        }
        config
    }

    pub fn use_placeholder(mut self, yes: bool) -> Self {
        self.use_placeholder = yes;
        self
    }

    pub fn max_scan_len(mut self, len: usize) -> Self {
        self.max_scan_len = len;
        self
    }

    pub fn allow_widening(mut self, yes: bool) -> Self {
        self.allow_widening = yes;
        self
    }

    pub fn trampoline_capacity(mut self, bytes: usize) -> Self {
        self.trampoline_capacity = bytes;
        self
    }

    pub fn mapping_size(mut self, bytes: usize) -> Self {
        self.mapping_size = bytes;
        self
    }
}
