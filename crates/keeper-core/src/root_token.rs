//! Root token hand-off between the two control loops.
//!
//! The bootstrap coordinator is the only writer: it publishes a new root
//! token whenever it initializes an instance. Every other consumer holds a
//! [`RootTokenWatch`] and reads the current value at the start of a cycle.
//! Backed by a `tokio::sync::watch` channel, so readers never block the
//! writer and always see the latest value.

use tokio::sync::watch;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A root or bootstrap token. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RootToken(String);

impl RootToken {
    /// Wrap a token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the plaintext token for an outgoing request.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Build from an optional, possibly empty, string.
    #[must_use]
    pub fn from_optional(token: Option<&str>) -> Option<Self> {
        token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Self::new)
    }
}

impl std::fmt::Debug for RootToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootToken([redacted])")
    }
}

/// Create the hand-off channel, seeded with the token known at startup.
#[must_use]
pub fn channel(initial: Option<RootToken>) -> (RootTokenPublisher, RootTokenWatch) {
    let (tx, rx) = watch::channel(initial);
    (RootTokenPublisher { tx }, RootTokenWatch { rx })
}

/// Sole writer of the current root token.
#[derive(Debug)]
pub struct RootTokenPublisher {
    tx: watch::Sender<Option<RootToken>>,
}

impl RootTokenPublisher {
    /// Replace the current token. Readers see it at their next read.
    pub fn publish(&self, token: RootToken) {
        self.tx.send_replace(Some(token));
    }

    /// The value currently published.
    #[must_use]
    pub fn current(&self) -> Option<RootToken> {
        self.tx.borrow().clone()
    }

    /// Another reader handle on the same channel.
    #[must_use]
    pub fn subscribe(&self) -> RootTokenWatch {
        RootTokenWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reader side of the hand-off channel.
#[derive(Debug, Clone)]
pub struct RootTokenWatch {
    rx: watch::Receiver<Option<RootToken>>,
}

impl RootTokenWatch {
    /// Read the current token and mark it as seen.
    pub fn current(&mut self) -> Option<RootToken> {
        self.rx.borrow_and_update().clone()
    }

    /// Whether any token is published. Does not mark it as seen.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Whether a token was published since the last [`current`](Self::current).
    ///
    /// A closed channel reports no change.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}
