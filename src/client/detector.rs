//! Palisade client failure detection module implementation.
//!
//! Purely advisory speculation about replica health, fed by the reply
//! traffic the client already generates. A replica that stays silent across
//! enough sweeps while requests to it are outstanding gets speculated dead;
//! any reply flips it back alive. Nothing here ever shortens or overrides a
//! lease deadline.

use std::collections::HashMap;

use crate::server::ReplicaId;
use crate::utils::{Bitmap, PalisadeError};

use rand::prelude::*;

use tokio::time::Duration;

/// Per-replica reply counters. Tuple of (#requests sent, #replies received,
/// #replies seen at last sweep, barren sweep repetition).
type ReplyCnts = (u64, u64, u64, u8);

/// The client-side failure speculation module.
pub struct FailureDetector {
    /// Consecutive barren sweeps before a replica is speculated dead.
    suspect_after: u8,

    /// Reply counters for approximate detection of replica health.
    reply_cnts: HashMap<ReplicaId, ReplyCnts>,

    /// Approximate health status tracking of replicas.
    peer_alive: Bitmap,
}

impl FailureDetector {
    /// Creates a new failure detector, initially speculating everyone
    /// alive.
    pub fn new(
        population: u8,
        suspect_after: u8,
    ) -> Result<Self, PalisadeError> {
        if population == 0 {
            return logged_err!("invalid population {}", population);
        }
        if suspect_after == 0 {
            return logged_err!("invalid suspect_after {}", suspect_after);
        }

        let reply_cnts =
            (0..population).map(|p| (p, (0, 0, 0, 0))).collect();

        Ok(FailureDetector {
            suspect_after,
            reply_cnts,
            peer_alive: Bitmap::new(population, true),
        })
    }

    /// Called when a request goes out to a replica.
    pub fn record_sent(&mut self, peer: ReplicaId) {
        if let Some(cnts) = self.reply_cnts.get_mut(&peer) {
            cnts.0 += 1;
        }
    }

    /// Called upon each tagged reply; checks if we should speculate that
    /// the replica is back up. Returns true if the speculation flipped.
    pub fn record_reply(
        &mut self,
        peer: ReplicaId,
    ) -> Result<bool, PalisadeError> {
        match self.reply_cnts.get_mut(&peer) {
            Some(cnts) => {
                cnts.1 += 1;
                cnts.3 = 0;

                if !self.peer_alive.get(peer)? {
                    self.peer_alive.set(peer, true)?;
                    pf_info!("peer_alive updated: {:?}", self.peer_alive);
                    return Ok(true);
                }
                Ok(false)
            }
            None => logged_err!("replica {} not found in reply_cnts", peer),
        }
    }

    /// Called on every sweep tick, increments barren sweep repetitions for
    /// replicas that owe replies, and checks if we should speculate that a
    /// replica is down. Returns true if any speculation flipped.
    pub fn sweep(&mut self) -> Result<bool, PalisadeError> {
        let mut peer_death = false;

        for (&peer, cnts) in self.reply_cnts.iter_mut() {
            if cnts.1 > cnts.2 {
                // more replies have come in from this replica since the
                // last sweep; it is probably alive
                cnts.2 = cnts.1;
                cnts.3 = 0;
            } else if cnts.0 > cnts.1 {
                // replies owed and none came in for a whole sweep;
                // increment repetition count
                cnts.3 += 1;

                if cnts.3 > self.suspect_after {
                    // silent for too many sweeps in a row; this replica is
                    // probably dead
                    if self.peer_alive.get(peer)? {
                        self.peer_alive.set(peer, false)?;
                        pf_info!("peer_alive updated: {:?}", self.peer_alive);
                        peer_death = true;
                    }
                    cnts.3 = 0;
                }
            }
        }

        Ok(peer_death)
    }

    /// Gets the speculated liveness status of replicas.
    pub fn peer_alive(&self) -> &Bitmap {
        &self.peer_alive
    }
}

/// Chooses a randomly jittered delay of `base` plus up to `jitter`, for
/// spacing out retries so competing clients do not stampede in lockstep.
pub fn jittered_delay(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        base
    } else {
        base + Duration::from_millis(
            thread_rng().gen_range(0..=jitter.as_millis() as u64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_speculates_death() -> Result<(), PalisadeError> {
        let mut fd = FailureDetector::new(3, 2)?;
        assert!(FailureDetector::new(0, 2).is_err());
        assert!(FailureDetector::new(3, 0).is_err());

        // replica 1 owes a reply and stays silent across sweeps
        fd.record_sent(1);
        for _ in 0..2 {
            assert!(!fd.sweep()?);
            assert!(fd.peer_alive().get(1)?);
        }
        assert!(fd.sweep()?);
        assert!(!fd.peer_alive().get(1)?);
        assert!(fd.peer_alive().get(0)?);
        assert!(fd.peer_alive().get(2)?);

        // a reply flips it back alive
        assert!(fd.record_reply(1)?);
        assert!(fd.peer_alive().get(1)?);
        Ok(())
    }

    #[test]
    fn detector_idle_is_not_death() -> Result<(), PalisadeError> {
        let mut fd = FailureDetector::new(3, 2)?;
        // nothing outstanding; sweeps gather no evidence
        for _ in 0..10 {
            assert!(!fd.sweep()?);
        }
        assert_eq!(fd.peer_alive().count(), 3);

        // replied-up replicas never accumulate repetitions
        fd.record_sent(0);
        assert!(!fd.record_reply(0)?);
        for _ in 0..10 {
            assert!(!fd.sweep()?);
        }
        assert_eq!(fd.peer_alive().count(), 3);
        Ok(())
    }

    #[test]
    fn jittered_delay_in_range() {
        let base = Duration::from_millis(100);
        assert_eq!(jittered_delay(base, Duration::ZERO), base);
        for _ in 0..100 {
            let d = jittered_delay(base, Duration::from_millis(50));
            assert!(d >= base && d <= base + Duration::from_millis(50));
        }
    }
}
