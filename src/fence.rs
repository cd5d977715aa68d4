//! Fencing token gate for resources guarded by palisade locks.
//!
//! Quorum leases alone cannot stop a holder that stalls past its lease
//! expiry and wakes up still believing it holds the lock. Fencing closes
//! that gap on the resource side: a `FenceGate` admits a write only if it
//! carries a token strictly higher than every token admitted for that name
//! before, and tokens grow with each handed-out lease, so writes of a
//! superseded holder bounce off no matter how delayed they arrive.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::sync::Mutex;

use crate::server::FencingToken;
use crate::utils::PalisadeError;

/// Error type returned to writes carrying an outdated fencing token.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct StaleFencingToken {
    /// The token the rejected write carried.
    pub seen: FencingToken,

    /// The highest token admitted for the name so far.
    pub highest: FencingToken,
}

impl fmt::Display for StaleFencingToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "stale fencing token {} (highest admitted {})",
            self.seen, self.highest
        )
    }
}

impl error::Error for StaleFencingToken {}

impl From<StaleFencingToken> for PalisadeError {
    fn from(e: StaleFencingToken) -> Self {
        PalisadeError::msg(e)
    }
}

/// Per-name watermark of the highest admitted fencing token.
#[derive(Debug, Default)]
pub struct FenceGate {
    /// Highest token admitted per lock name.
    highest: Mutex<HashMap<String, FencingToken>>,
}

impl FenceGate {
    /// Creates an empty fence gate.
    pub fn new() -> Self {
        FenceGate::default()
    }

    /// Admits a write guarded by the named lock iff its token is strictly
    /// higher than every token admitted for that name before. Tokens start
    /// at 1, so a zero token never passes.
    pub fn admit(
        &self,
        name: &str,
        token: FencingToken,
    ) -> Result<(), StaleFencingToken> {
        let mut highest = self.highest.lock().unwrap();
        let cur = highest.get(name).copied().unwrap_or(0);
        if token > cur {
            highest.insert(name.to_string(), token);
            Ok(())
        } else {
            Err(StaleFencingToken {
                seen: token,
                highest: cur,
            })
        }
    }

    /// Returns the highest token admitted for the given name, if any.
    pub fn highest(&self, name: &str) -> Option<FencingToken> {
        let highest = self.highest.lock().unwrap();
        highest.get(name).copied()
    }
}
