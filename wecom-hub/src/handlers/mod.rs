//! Text command handlers bound to applications through the registry.

pub mod feed;
pub mod subscription;
pub mod torrent;

pub use feed::{FeedCommand, FeedHandler};
pub use subscription::{SubscriptionCommand, SubscriptionHandler};
pub use torrent::{TorrentCommand, TorrentHandler};

/// Collapse runs of whitespace and trim, so "  sub   123 " reads as "sub 123".
pub(crate) fn normalize(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(normalize("  sub \t 123001\n"), "sub 123001");
        assert_eq!(normalize(""), "");
    }
}
