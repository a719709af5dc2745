/// Component tags attached to every log line.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogTag {
    System,
    HeadTracker,
    Broadcaster,
    Confirmer,
    Jobs,
    Store,
    Config,
}

impl LogTag {
    pub const ALL: [LogTag; 7] = [
        LogTag::System,
        LogTag::HeadTracker,
        LogTag::Broadcaster,
        LogTag::Confirmer,
        LogTag::Jobs,
        LogTag::Store,
        LogTag::Config,
    ];

    /// Uppercase label used in console and file output
    pub fn to_plain_string(&self) -> &'static str {
        match self {
            LogTag::System => "SYSTEM",
            LogTag::HeadTracker => "HEADS",
            LogTag::Broadcaster => "BROADCAST",
            LogTag::Confirmer => "CONFIRM",
            LogTag::Jobs => "JOBS",
            LogTag::Store => "STORE",
            LogTag::Config => "CONFIG",
        }
    }

    /// Key used to enable debug output for this tag (`CHAINTX_DEBUG=heads,confirm`)
    pub fn to_debug_key(&self) -> String {
        self.to_plain_string().to_lowercase()
    }

    pub fn from_debug_key(key: &str) -> Option<LogTag> {
        let key = key.trim().to_lowercase();
        LogTag::ALL.iter().copied().find(|tag| tag.to_debug_key() == key)
    }
}

impl std::fmt::Display for LogTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_plain_string())
    }
}
