//! IPC deadlock detection
//!
//! Before a process blocks on a peer, the chain "whom does the peer wait
//! for" is followed. If it leads back to the caller, blocking would close
//! a cycle and the operation is refused instead.
//!
//! Processes outside the caller's `ProcSet` are read through their
//! published shadows. A CPU announces its own blocked state before
//! walking, so when two CPUs close a cycle at the same moment at least one
//! of them sees the complete cycle.

use super::IpcCall;
use crate::proc::{BlockedOn, Endpoint, ProcNr, ProcSet};

const CHAIN_LOG: usize = 8;

fn view(set: &ProcSet, ep: Endpoint) -> Option<BlockedOn> {
    let k = set.kernel();
    let nr = ep.slot();
    if ep.is_special() || nr >= k.procs().len() {
        return None;
    }
    if set.contains(nr) {
        let p = set.get(nr);
        if p.endpoint != ep {
            return None;
        }
        Some(BlockedOn::of(p))
    } else {
        let slot = k.procs().slot(nr);
        if slot.endpoint() != ep {
            return None;
        }
        Some(slot.blocked())
    }
}

/// Size of the cycle `caller` would close by blocking on `peer_e`, or 0
///
/// `call` is `Send` or `Receive`, the direction of the caller's block.
pub fn check(set: &ProcSet, caller: ProcNr, peer_e: Endpoint, call: IpcCall) -> usize {
    let k = set.kernel();
    let caller_e = set.get(caller).endpoint;
    let limit = k.procs().len();

    let mut chain = [Endpoint::NONE; CHAIN_LOG];
    chain[0] = caller_e;
    let mut group = 1;
    let mut next = peer_e;

    let group = loop {
        if next == caller_e {
            break group;
        }
        let xp = match view(set, next) {
            Some(xp) if xp.is_blocked() => xp,
            _ => return 0,
        };
        if group < CHAIN_LOG {
            chain[group] = next;
        }
        group += 1;
        if group > limit {
            // Torn shadows can form a path longer than the table; not a cycle
            return 0;
        }

        if xp.target == caller_e && group == 2 {
            // A send meeting a receive is a rendezvous, not a deadlock
            let pairing = match call {
                IpcCall::Receive => xp.sending,
                _ => !xp.sending || xp.reply_pend,
            };
            if pairing {
                return 0;
            }
        }
        next = xp.target;
    };

    k.metrics().inc_deadlocks();
    crate::log_warn!(
        cpu = set.cpu();
        "ipc",
        "{} from {} to {} refused: cycle of {} {:?}",
        call.name(),
        caller_e,
        peer_e,
        group,
        &chain[..group.min(CHAIN_LOG)]
    );
    group
}
