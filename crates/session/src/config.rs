/// Per-session settings, fixed when the session is opened.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Let an uninitialized proxy fetch its row after its session closed.
    /// The fetched state is detached: nothing tracks or writes it back.
    pub lazy_load_no_trans: bool,
    /// Upper bound on instances held by one session.
    pub max_entities: Option<usize>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lazy_load_no_trans(mut self, enabled: bool) -> Self {
        self.lazy_load_no_trans = enabled;
        self
    }

    pub fn max_entities(mut self, limit: usize) -> Self {
        self.max_entities = Some(limit);
        self
    }
}
