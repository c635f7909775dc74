//! Out-of-sockets defense: when descriptors run low, close the connections we can best
//! afford to lose.

use crate::{options::OosOptions, ConnId};

/// What victim selection needs to know about a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OosCandidate {
    pub id: ConnId,
    pub is_relay: bool,
    /// Active sessions carried by the connection. Fewer is a better victim.
    pub sessions: usize,
}

/// Returns how many more connections to close.
///
/// Above the high threshold we close down to the low threshold. Below it, a socket
/// allocation that failed for lack of resources still costs us a tenth of the open
/// descriptors. Connections already marked for close count toward the total, so that
/// repeated checks don't kill more than needed.
pub fn plan(open: usize, exhaustion: bool, options: &OosOptions, moribund: usize) -> usize {
    if !options.enabled {
        return 0;
    }

    let target = if open > options.high_threshold {
        options.low_threshold
    } else if exhaustion {
        open * 9 / 10
    } else {
        return 0;
    };

    open.saturating_sub(target).saturating_sub(moribund)
}

/// Picks up to `n` victims: relay links before everything else, fewest sessions first.
/// The sort is stable, so ties keep the order they came in.
pub fn select_victims(mut candidates: Vec<OosCandidate>, n: usize) -> Vec<ConnId> {
    candidates.sort_by_key(|c| (!c.is_relay, c.sessions));
    candidates.into_iter().take(n).map(|c| c.id).collect()
}
