use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "FitLink";

/// Maximum number of characters kept in `lastMessagePreview`
pub const PREVIEW_CHARS: usize = 100;

/// Maximum message content length in characters
pub const MAX_CONTENT_CHARS: usize = 5000;

/// Page size used when the caller does not pass one
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound for any requested page size
pub const MAX_PAGE_SIZE: u32 = 100;

/// Typing indicator auto-expiry
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay between a disconnect and the user being reported offline
pub const PRESENCE_GRACE: Duration = Duration::from_secs(30);

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
